// Session state and the typed command handlers behind the pipe.

use super::protocol::{Command, OutputMode, Reply};
use crate::error::{BridgeError, Result};
use crate::layer::{CropRect, InputMode, Layer, LayerCollection, Surface};
use crate::output::{CompletionNotifier, OutputImageState, OutputSlot};
use crate::shm::{self, SharedSegment, TransferRegistry, TransferUnit};
use log::{debug, info, warn};
use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Connection cycle of the pipe endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionPhase {
    Idle = 0,
    WaitingForConnection = 1,
    ServingRequest = 2,
    WaitingForClientAck = 3,
    Restarting = 4,
    /// The serving loop ended after a fatal error.
    Stopped = 5,
    Disposed = 6,
}

impl SessionPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::WaitingForConnection,
            2 => Self::ServingRequest,
            3 => Self::WaitingForClientAck,
            4 => Self::Restarting,
            5 => Self::Stopped,
            6 => Self::Disposed,
            _ => Self::Idle,
        }
    }
}

/// What a disposal released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleaseSummary {
    pub layers: usize,
    pub segments: usize,
    pub output_images: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything one session owns. Mutated only from the pipe thread while serving.
pub struct Session {
    layers: Mutex<LayerCollection>,
    transfers: Mutex<TransferRegistry>,
    output: Arc<OutputSlot>,
    notifier: CompletionNotifier,
    command_name: Mutex<Option<String>>,
    last_error: Mutex<Option<BridgeError>>,
    phase: AtomicU8,
}

impl Session {
    pub fn new(notifier: CompletionNotifier) -> Self {
        Self {
            layers: Mutex::new(LayerCollection::new()),
            transfers: Mutex::new(TransferRegistry::new()),
            output: Arc::new(OutputSlot::new()),
            notifier,
            command_name: Mutex::new(None),
            last_error: Mutex::new(None),
            phase: AtomicU8::new(SessionPhase::Idle as u8),
        }
    }

    pub fn layers(&self) -> MutexGuard<'_, LayerCollection> {
        lock(&self.layers)
    }

    pub fn output(&self) -> &Arc<OutputSlot> {
        &self.output
    }

    pub fn notifier(&self) -> &CompletionNotifier {
        &self.notifier
    }

    pub fn outstanding_segments(&self) -> usize {
        lock(&self.transfers).len()
    }

    pub fn command_name(&self) -> Option<String> {
        lock(&self.command_name).clone()
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn record_error(&self, error: BridgeError) {
        *lock(&self.last_error) = Some(error);
    }

    pub fn take_error(&self) -> Option<BridgeError> {
        lock(&self.last_error).take()
    }

    /// Serve one decoded request.
    pub fn handle(&self, command: Command) -> Result<Reply> {
        match command {
            Command::GetMaxLayerSize { mode } => Ok(self.get_max_layer_size(mode)),
            Command::GetCroppedImages { mode, crop } => self.get_cropped_images(mode, crop),
            Command::OutputImages { mode, images } => self.output_images(mode, &images),
            Command::ReleaseSharedMemory => Ok(self.release_shared_memory()),
            Command::SetGmicCommandName { name } => Ok(self.set_gmic_command_name(name)),
        }
    }

    fn get_max_layer_size(&self, mode: InputMode) -> Reply {
        let (width, height) = self.layers().max_size(mode);
        debug!("[SESSION] Max layer size for {:?}: {}x{}", mode, width, height);
        Reply::Single(format!("{},{}", width, height))
    }

    fn get_cropped_images(&self, mode: InputMode, crop: CropRect) -> Result<Reply> {
        if mode.is_deprecated() {
            warn!("[SESSION] Deprecated input mode {:?} requested", mode);
        }

        let segments = {
            let layers = self.layers();
            layers
                .select(mode)
                .into_iter()
                .enumerate()
                .map(|(index, layer)| {
                    let rect = crop.to_pixels(layer.width(), layer.height());
                    if rect.is_empty() {
                        return Err(BridgeError::resource(
                            format!("Cropping selected layer {}", index),
                            io::Error::new(
                                io::ErrorKind::InvalidInput,
                                format!(
                                    "crop {:?} leaves nothing of a {}x{} layer",
                                    crop,
                                    layer.width(),
                                    layer.height()
                                ),
                            ),
                        ));
                    }
                    SharedSegment::publish(layer.surface(), rect)
                })
                .collect::<Result<Vec<_>>>()?
        };

        let lines: Vec<String> = segments.iter().map(|s| s.unit().to_string()).collect();
        info!(
            "[SESSION] Published {} cropped layer(s) for {:?}",
            segments.len(),
            mode
        );

        let mut transfers = lock(&self.transfers);
        for segment in segments {
            transfers.track(segment);
        }

        Ok(Reply::Lines(lines))
    }

    fn output_images(&self, mode: OutputMode, units: &[TransferUnit]) -> Result<Reply> {
        // Field errors are fatal; only reading the segments may fail softly.
        for unit in units {
            unit.validate()?;
        }

        let read: Result<Vec<Surface>> = units.iter().map(shm::read_output).collect();

        let state = match read {
            Ok(images) => {
                if let Some(first) = images.first() {
                    self.replace_active_layer(first.clone());
                }
                info!("[SESSION] Received {} output image(s)", images.len());
                self.output
                    .publish_with(|generation| OutputImageState::success(generation, mode, images))
            }
            Err(e) => {
                warn!("[SESSION] Output images could not be read: {}", e);
                self.output
                    .publish_with(|generation| OutputImageState::failure(generation, e))
            }
        };

        self.notifier.notify(state);
        Ok(Reply::done())
    }

    /// Make `surface` the active layer so the next run filters the result.
    fn replace_active_layer(&self, surface: Surface) {
        let mut layers = self.layers();
        let visible = layers.active().map(Layer::is_visible).unwrap_or(true);
        if layers.replace_active(Layer::owned(surface, visible)).is_none() {
            debug!("[SESSION] No active layer to replace");
        }
    }

    fn release_shared_memory(&self) -> Reply {
        lock(&self.transfers).release_all();
        Reply::done()
    }

    fn set_gmic_command_name(&self, name: String) -> Reply {
        debug!("[SESSION] Command name: {}", name);
        *lock(&self.command_name) = Some(name);
        Reply::done()
    }

    /// Release layers, segments and the current output.
    pub fn release_all(&self) -> ReleaseSummary {
        let layers = self.layers().clear();
        let segments = lock(&self.transfers).release_all();
        let output_images = self.output.current().map_or(0, |state| state.image_count());
        self.output.close();
        self.notifier.clear();

        ReleaseSummary {
            layers,
            segments,
            output_images,
        }
    }
}
