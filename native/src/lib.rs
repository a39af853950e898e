pub mod config;
pub mod error;
pub mod ipc;
pub mod launcher;
pub mod layer;
pub mod logging;
pub mod output;
pub mod shm;

use log::info;

pub use config::{BridgeConfig, ExternalArch};
pub use error::{BridgeError, Result};
pub use ipc::{OutputMode, PipeServer, ReleaseSummary, SessionPhase};
pub use launcher::{GmicLauncher, RunOutcome};
pub use layer::{CropRect, InputMode, Layer, LayerCollection, LayerSource, Surface};
pub use output::{
    CompletionDispatch, DispatchQueue, ExecutionContext, Immediate, OutputImageState,
    OutputImages, OutputReceiver,
};

/// Set up logging, the crash log and optional Sentry reporting. Call once at startup.
pub fn initialize_diagnostics() {
    logging::init_logger();
    logging::init_crash_logger();
    let sentry = logging::init_sentry_from_env();
    info!(
        "[INIT] gmic-bridge {} ready (sentry: {})",
        get_version(),
        if sentry { "on" } else { "off" }
    );
}

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
