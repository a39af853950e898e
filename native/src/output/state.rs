//! The result of one `output_images` exchange and the slot holding the current one.

use crate::error::{BridgeError, Result};
use crate::ipc::protocol::OutputMode;
use crate::layer::Surface;
use arc_swap::ArcSwapOption;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Images produced by the external process, in submission order.
#[derive(Debug)]
pub struct OutputImages {
    pub mode: OutputMode,
    pub images: Vec<Surface>,
}

#[derive(Debug)]
enum Contents {
    Images(OutputImages),
    Error(BridgeError),
    Taken,
    Disposed,
}

/// Terminal state of one output submission: an error or the produced images.
///
/// The contents can be taken once. After that, or after disposal, reads fail.
#[derive(Debug)]
pub struct OutputImageState {
    generation: u64,
    contents: Mutex<Contents>,
}

impl OutputImageState {
    pub(crate) fn success(generation: u64, mode: OutputMode, images: Vec<Surface>) -> Self {
        Self {
            generation,
            contents: Mutex::new(Contents::Images(OutputImages { mode, images })),
        }
    }

    pub(crate) fn failure(generation: u64, error: BridgeError) -> Self {
        Self {
            generation,
            contents: Mutex::new(Contents::Error(error)),
        }
    }

    fn contents(&self) -> std::sync::MutexGuard<'_, Contents> {
        self.contents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sequence number of the submission that produced this state, starting at 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_error(&self) -> bool {
        matches!(*self.contents(), Contents::Error(_))
    }

    pub fn is_disposed(&self) -> bool {
        matches!(*self.contents(), Contents::Disposed)
    }

    /// Number of images still held. Zero once taken, disposed, or on error.
    pub fn image_count(&self) -> usize {
        match &*self.contents() {
            Contents::Images(output) => output.images.len(),
            _ => 0,
        }
    }

    /// Take the result out. The state cannot be read again afterwards.
    pub fn take(&self) -> Result<OutputImages> {
        let mut contents = self.contents();
        match std::mem::replace(&mut *contents, Contents::Taken) {
            Contents::Images(output) => Ok(output),
            Contents::Error(error) => Err(error),
            Contents::Taken => Err(BridgeError::StateViolation("output images already taken")),
            Contents::Disposed => {
                *contents = Contents::Disposed;
                Err(BridgeError::StateViolation("output images were disposed"))
            }
        }
    }

    /// Release held images. Returns how many surfaces were freed.
    pub fn dispose(&self) -> usize {
        let mut contents = self.contents();
        match std::mem::replace(&mut *contents, Contents::Disposed) {
            Contents::Images(output) => output.images.len(),
            _ => 0,
        }
    }
}

#[derive(Debug, Default)]
struct Signal {
    generation: u64,
    closed: bool,
}

/// Holds exactly one current output state. Publishing swaps atomically and
/// disposes the predecessor.
#[derive(Debug, Default)]
pub struct OutputSlot {
    current: ArcSwapOption<OutputImageState>,
    signal: Mutex<Signal>,
    changed: Condvar,
}

impl OutputSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn signal(&self) -> std::sync::MutexGuard<'_, Signal> {
        self.signal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build the next state with a fresh generation and make it current.
    pub(crate) fn publish_with<F>(&self, build: F) -> Arc<OutputImageState>
    where
        F: FnOnce(u64) -> OutputImageState,
    {
        let mut signal = self.signal();
        signal.generation += 1;
        let state = Arc::new(build(signal.generation));

        if let Some(previous) = self.current.swap(Some(Arc::clone(&state))) {
            previous.dispose();
        }

        drop(signal);
        self.changed.notify_all();
        state
    }

    pub fn current(&self) -> Option<Arc<OutputImageState>> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.signal().generation
    }

    /// Dispose the current state and wake every waiter for good.
    pub(crate) fn close(&self) {
        let mut signal = self.signal();
        signal.closed = true;
        if let Some(previous) = self.current.swap(None) {
            previous.dispose();
        }
        drop(signal);
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.signal().closed
    }
}

/// Waits for results newer than the last one it returned.
#[derive(Debug)]
pub struct OutputReceiver {
    slot: Arc<OutputSlot>,
    seen: u64,
}

impl OutputReceiver {
    pub(crate) fn new(slot: Arc<OutputSlot>) -> Self {
        let seen = slot.generation();
        Self { slot, seen }
    }

    /// Return a newer result if one is already available.
    pub fn try_next(&mut self) -> Option<Arc<OutputImageState>> {
        let slot = Arc::clone(&self.slot);
        let signal = slot.signal();
        self.next_after(&signal)
    }

    /// Block until a newer result arrives. `None` once the session is disposed.
    pub fn wait_next(&mut self) -> Option<Arc<OutputImageState>> {
        let slot = Arc::clone(&self.slot);
        let mut signal = slot.signal();
        loop {
            if let Some(state) = self.next_after(&signal) {
                return Some(state);
            }
            if signal.closed {
                return None;
            }
            signal = slot
                .changed
                .wait(signal)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_next`](Self::wait_next) but gives up after `timeout`.
    pub fn wait_next_timeout(&mut self, timeout: Duration) -> Option<Arc<OutputImageState>> {
        let deadline = Instant::now() + timeout;
        let slot = Arc::clone(&self.slot);
        let mut signal = slot.signal();
        loop {
            if let Some(state) = self.next_after(&signal) {
                return Some(state);
            }
            let now = Instant::now();
            if signal.closed || now >= deadline {
                return None;
            }
            signal = slot
                .changed
                .wait_timeout(signal, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn next_after(&mut self, signal: &Signal) -> Option<Arc<OutputImageState>> {
        if signal.generation <= self.seen {
            return None;
        }
        let state = self.slot.current()?;
        self.seen = state.generation();
        Some(state)
    }
}
