//! Shared memory transfer units.
//!
//! Pixels cross the process boundary through named shared memory segments.
//! Each segment holds one image: `stride * height` bytes of raw BGRA rows,
//! no header and no padding beyond the stride.
//!
//! ## Platform support
//!
//! - Windows: `CreateFileMappingW` / `MapViewOfFile` on the paging file
//! - Unix: `memmap2` over files in `/dev/shm`

#[cfg(unix)]
mod platform_unix;
#[cfg(windows)]
mod platform_windows;

#[cfg(unix)]
pub use platform_unix::segment_path;
#[cfg(unix)]
use platform_unix::{PlatformSegment, PlatformView};
#[cfg(windows)]
use platform_windows::{PlatformSegment, PlatformView};

use crate::error::{BridgeError, Result};
use crate::layer::surface::BYTES_PER_PIXEL;
use crate::layer::{PixelRect, Surface};
use log::{debug, info};
use std::fmt;
use uuid::Uuid;

/// Prefix of every segment name this process creates.
pub const SEGMENT_PREFIX: &str = "gmic_bridge_";

/// Generate a fresh, unguessable segment name.
pub fn generate_segment_name() -> String {
    format!("{}{}", SEGMENT_PREFIX, Uuid::new_v4().simple())
}

/// Description of one segment as exchanged on the pipe: `name,width,height,stride`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferUnit {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes.
    pub stride: usize,
}

impl TransferUnit {
    /// Parse `name,width,height,stride`.
    pub fn parse(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split(',').collect();
        if parts.len() != 4 || parts[0].is_empty() {
            return Err(BridgeError::protocol(format!(
                "expected 'name,width,height,stride', got '{}'",
                value
            )));
        }

        let number = |field: &str, what: &str| {
            field.trim().parse::<u64>().map_err(|_| {
                BridgeError::protocol(format!("invalid {} '{}' in '{}'", what, field, value))
            })
        };

        let width = u32::try_from(number(parts[1], "width")?)
            .map_err(|_| BridgeError::protocol(format!("width out of range in '{}'", value)))?;
        let height = u32::try_from(number(parts[2], "height")?)
            .map_err(|_| BridgeError::protocol(format!("height out of range in '{}'", value)))?;
        let stride = usize::try_from(number(parts[3], "stride")?)
            .map_err(|_| BridgeError::protocol(format!("stride out of range in '{}'", value)))?;

        Ok(Self {
            name: parts[0].to_string(),
            width,
            height,
            stride,
        })
    }

    /// Segment size in bytes. `None` on overflow.
    pub fn byte_len(&self) -> Option<usize> {
        self.stride.checked_mul(self.height as usize)
    }

    pub(crate) fn validate(&self) -> Result<usize> {
        if self.width == 0 || self.height == 0 {
            return Err(BridgeError::protocol(format!(
                "image '{}' has an empty size {}x{}",
                self.name, self.width, self.height
            )));
        }
        if self.stride < self.width as usize * BYTES_PER_PIXEL {
            return Err(BridgeError::protocol(format!(
                "image '{}' stride {} is shorter than a {}-pixel row",
                self.name, self.stride, self.width
            )));
        }
        self.byte_len().ok_or_else(|| {
            BridgeError::protocol(format!("image '{}' size overflows", self.name))
        })
    }
}

impl fmt::Display for TransferUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.name, self.width, self.height, self.stride)
    }
}

/// A segment created by this process, mapped until dropped.
pub struct SharedSegment {
    unit: TransferUnit,
    mapping: PlatformSegment,
}

impl SharedSegment {
    /// Create a zero-filled segment of exactly `stride * height` bytes.
    pub fn create(width: u32, height: u32, stride: usize) -> Result<Self> {
        let unit = TransferUnit {
            name: generate_segment_name(),
            width,
            height,
            stride,
        };
        let len = unit.validate()?;

        let mapping = PlatformSegment::create(&unit.name, len).map_err(|e| {
            BridgeError::resource(format!("Creating shared memory '{}'", unit.name), e)
        })?;

        debug!("[SHM] Created {} ({} bytes)", unit.name, len);
        Ok(Self { unit, mapping })
    }

    /// Copy a region of `surface` row by row into a new segment.
    pub fn publish(surface: &Surface, rect: PixelRect) -> Result<Self> {
        let stride = rect.width as usize * BYTES_PER_PIXEL;
        let mut segment = Self::create(rect.width, rect.height, stride)?;

        let dest = segment.mapping.as_mut_slice();
        for (row, src) in surface.region_rows(rect).enumerate() {
            let offset = row * stride;
            dest[offset..offset + stride].copy_from_slice(src);
        }

        Ok(segment)
    }

    pub fn unit(&self) -> &TransferUnit {
        &self.unit
    }

    pub fn bytes(&self) -> &[u8] {
        self.mapping.as_slice()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.mapping.as_mut_slice()
    }
}

impl fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedSegment").field("unit", &self.unit).finish()
    }
}

/// Read a segment written by the external process into a new surface.
///
/// A missing segment is a resource failure: names are ephemeral and cannot be retried.
pub fn read_output(unit: &TransferUnit) -> Result<Surface> {
    let len = unit.validate()?;
    let view = PlatformView::open(&unit.name, len).map_err(|e| {
        BridgeError::resource(format!("Opening shared memory '{}'", unit.name), e)
    })?;

    let src = view.as_slice();
    let mut surface = Surface::new(unit.width, unit.height);
    let row_len = unit.width as usize * BYTES_PER_PIXEL;
    for y in 0..unit.height {
        let offset = y as usize * unit.stride;
        surface
            .row_mut(y)
            .copy_from_slice(&src[offset..offset + row_len]);
    }

    debug!("[SHM] Read {} ({}x{})", unit.name, unit.width, unit.height);
    Ok(surface)
}

/// Segments handed to the external process, kept mapped until it asks for release.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    segments: Vec<SharedSegment>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, segment: SharedSegment) {
        self.segments.push(segment);
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn units(&self) -> impl Iterator<Item = &TransferUnit> {
        self.segments.iter().map(SharedSegment::unit)
    }

    /// Unmap every tracked segment. Returns how many were released.
    pub fn release_all(&mut self) -> usize {
        let count = self.segments.len();
        if count > 0 {
            info!("[SHM] Releasing {} shared memory segment(s)", count);
        }
        self.segments.clear();
        count
    }
}
