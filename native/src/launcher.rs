// Locates and runs the external filter process against a started session.

use crate::config::{BridgeConfig, ExternalArch};
use crate::error::{BridgeError, Result};
use crate::ipc::PipeServer;
use crate::layer::{exceeds_32bit_size, LayerCollection};
use crate::output::{DispatchQueue, OutputImages};
use log::{debug, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command as StdCommand, ExitStatus};
use std::time::Duration;

pub const GMIC_EXECUTABLE_NAME: &str = "gmic_paintdotnet_qt.exe";
const GMIC_SUBDIRECTORY: &str = "gmic";
/// Extra argument asking the filter UI to repeat its last filter without showing itself.
pub const REAPPLY_ARG: &str = "reapply";
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What a finished filter run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// `None` when the user closed the filter UI without applying.
    pub output: Option<OutputImages>,
    pub command_name: Option<String>,
}

/// Executable candidates inside `dir`, most specific first.
pub fn candidates(dir: &Path) -> Vec<PathBuf> {
    let mut names = vec![GMIC_EXECUTABLE_NAME.to_string()];
    if !cfg!(windows) {
        if let Some(stem) = Path::new(GMIC_EXECUTABLE_NAME).file_stem() {
            names.push(stem.to_string_lossy().into_owned());
        }
    }

    let mut paths = Vec::new();
    for name in &names {
        paths.push(dir.join(GMIC_SUBDIRECTORY).join(name));
        paths.push(dir.join(name));
    }
    paths
}

/// Reject layers the 32-bit filter engine cannot address.
pub fn preflight(layers: &LayerCollection, arch: ExternalArch) -> Result<()> {
    preflight_sizes(layers.iter().map(|l| (l.width(), l.height())), arch)
}

pub fn preflight_sizes<I>(sizes: I, arch: ExternalArch) -> Result<()>
where
    I: IntoIterator<Item = (u32, u32)>,
{
    if !arch.is_32bit() {
        return Ok(());
    }

    match sizes
        .into_iter()
        .find(|&(width, height)| exceeds_32bit_size(width, height))
    {
        Some((width, height)) => Err(BridgeError::ImageTooLargeForX86 { width, height }),
        None => Ok(()),
    }
}

fn largest_layer(layers: &LayerCollection) -> (u32, u32) {
    layers
        .iter()
        .max_by_key(|l| u64::from(l.width()) * u64::from(l.height()))
        .map_or((0, 0), |l| (l.width(), l.height()))
}

#[derive(Debug, Clone)]
pub struct GmicLauncher {
    executable: PathBuf,
    host_marker: String,
    arch: ExternalArch,
}

impl GmicLauncher {
    pub fn new(executable: PathBuf, config: &BridgeConfig) -> Self {
        Self {
            executable,
            host_marker: config.host_marker.clone(),
            arch: config.external_arch,
        }
    }

    /// Use the configured executable, else search next to the running binary.
    pub fn locate(config: &BridgeConfig) -> Result<Self> {
        if let Some(path) = &config.gmic_executable {
            if path.is_file() {
                return Ok(Self::new(path.clone(), config));
            }
            return Err(not_found(format!(
                "Configured executable {} does not exist",
                path.display()
            )));
        }

        let exe = std::env::current_exe()?;
        let dir = exe.parent().unwrap_or_else(|| Path::new("."));
        let found = candidates(dir).into_iter().find(|p| p.is_file());
        match found {
            Some(path) => {
                debug!("[LAUNCH] Found {:?}", path);
                Ok(Self::new(path, config))
            }
            None => Err(not_found(format!(
                "{} not found next to {}",
                GMIC_EXECUTABLE_NAME,
                dir.display()
            ))),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// `<hostMarker> <pipe> [reapply]`
    pub fn build_args(&self, pipe_name: &str, reapply: bool) -> Vec<String> {
        let mut args = vec![self.host_marker.clone(), pipe_name.to_string()];
        if reapply {
            args.push(REAPPLY_ARG.to_string());
        }
        args
    }

    /// Start `server`, run the filter process to completion, collect its result.
    ///
    /// Completions dispatched to a [`DispatchQueue`] are never run here; use
    /// [`run_pumping`](Self::run_pumping) when the server was built with one.
    pub fn run(&self, server: &PipeServer, reapply: bool) -> Result<RunOutcome> {
        self.run_with(server, reapply, None)
    }

    /// Like [`run`](Self::run), but keeps running `queue` jobs while the process is alive.
    ///
    /// Must be called on the queue's owner thread. A completion sent to that queue would
    /// otherwise hold the filter process, which waits for its reply before exiting.
    pub fn run_pumping(
        &self,
        server: &PipeServer,
        reapply: bool,
        queue: &DispatchQueue,
    ) -> Result<RunOutcome> {
        if !queue.is_owner_thread() {
            return Err(BridgeError::StateViolation(
                "completion queue must be pumped by its owner thread",
            ));
        }
        self.run_with(server, reapply, Some(queue))
    }

    fn run_with(
        &self,
        server: &PipeServer,
        reapply: bool,
        queue: Option<&DispatchQueue>,
    ) -> Result<RunOutcome> {
        server.inspect_layers(|layers| preflight(layers, self.arch))?;
        server.start()?;

        let args = self.build_args(server.full_pipe_name(), reapply);
        info!("[LAUNCH] Starting {:?} {:?}", self.executable, args);

        let mut child = StdCommand::new(&self.executable)
            .args(&args)
            .spawn()
            .map_err(|e| {
                BridgeError::resource(format!("Starting {}", self.executable.display()), e)
            })?;
        let status = self.wait_for_exit(&mut child, queue)?;
        info!("[LAUNCH] Filter process exited with {:?}", status.code());

        if let Some(error) = BridgeError::from_exit_code(status.code()) {
            return Err(match error {
                BridgeError::ImageTooLargeForX86 { .. } => {
                    let (width, height) = server.inspect_layers(largest_layer);
                    BridgeError::ImageTooLargeForX86 { width, height }
                }
                other => other,
            });
        }

        if let Some(error) = server.take_session_error() {
            warn!("[LAUNCH] Session failed: {}", error);
            return Err(error);
        }

        let output = server
            .current_output()
            .map(|state| state.take())
            .transpose()?;

        Ok(RunOutcome {
            output,
            command_name: server.gmic_command_name(),
        })
    }

    fn wait_for_exit(
        &self,
        child: &mut Child,
        queue: Option<&DispatchQueue>,
    ) -> Result<ExitStatus> {
        let waiting = |e: io::Error| {
            BridgeError::resource(format!("Waiting for {}", self.executable.display()), e)
        };

        let Some(queue) = queue else {
            return child.wait().map_err(waiting);
        };
        loop {
            if let Some(status) = child.try_wait().map_err(waiting)? {
                // Posted completions may still be queued.
                queue.run_pending();
                return Ok(status);
            }
            queue.run_for(EXIT_POLL_INTERVAL);
        }
    }
}

fn not_found(message: String) -> BridgeError {
    BridgeError::resource(
        "Locating the filter engine",
        io::Error::new(io::ErrorKind::NotFound, message),
    )
}
