// Shared memory as files under /dev/shm, the same namespace `shm_open` uses.

use memmap2::{Mmap, MmapMut};
use once_cell::sync::Lazy;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Directory holding segment files, chosen once per process.
static SEGMENT_DIR: Lazy<PathBuf> = Lazy::new(|| {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
});

pub fn segment_dir() -> &'static Path {
    &SEGMENT_DIR
}

pub fn segment_path(name: &str) -> PathBuf {
    segment_dir().join(name)
}

/// A writable segment created by this process. The backing file is removed on drop.
pub struct PlatformSegment {
    map: MmapMut,
    path: PathBuf,
}

impl PlatformSegment {
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let path = segment_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(len as u64)?;

        // Nothing else maps the file until its name is handed out.
        let map = match unsafe { MmapMut::map_mut(&file) } {
            Ok(map) => map,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };

        Ok(Self { map, path })
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map[..]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..]
    }
}

impl Drop for PlatformSegment {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// A read-only view of a segment created by another process.
pub struct PlatformView {
    map: Mmap,
    len: usize,
}

impl PlatformView {
    pub fn open(name: &str, len: usize) -> io::Result<Self> {
        let file = File::open(segment_path(name))?;
        let actual = file.metadata()?.len();
        if actual < len as u64 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("shared memory '{}' holds {} bytes, expected {}", name, actual, len),
            ));
        }

        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map[..self.len]
    }
}
