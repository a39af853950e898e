// Session server: one pipe, one request per connection, explicit client acks.

use super::endpoint::{self, PipeEndpoint, PipeStream};
use super::handler::{ReleaseSummary, Session, SessionPhase};
use super::protocol::{decode_payload, read_ack, read_frame, write_frame, Command};
use crate::error::{BridgeError, Result};
use crate::layer::{Layer, LayerCollection, Surface};
use crate::output::{
    CompletionDispatch, CompletionNotifier, ExecutionContext, OutputImageState, OutputReceiver,
};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use uuid::Uuid;

const PIPE_NAME_PREFIX: &str = "gmic-bridge-";
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Host side of a filter session.
///
/// Configure layers, [`start`](Self::start), hand [`full_pipe_name`](Self::full_pipe_name)
/// to the external process, then wait for output through [`subscribe`](Self::subscribe)
/// or [`on_output_image_changed`](Self::on_output_image_changed).
pub struct PipeServer {
    session: Arc<Session>,
    pipe_name: String,
    full_pipe_name: String,
    runtime: Mutex<Option<Runtime>>,
    shutdown_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
    shutdown_complete_rx: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl PipeServer {
    /// Server whose completion callbacks run on the pipe thread.
    pub fn new() -> Self {
        Self::with_notifier(CompletionNotifier::direct())
    }

    /// Server raising completions through `context`.
    pub fn with_completion(context: Arc<dyn ExecutionContext>, dispatch: CompletionDispatch) -> Self {
        Self::with_notifier(CompletionNotifier::new(context, dispatch))
    }

    fn with_notifier(notifier: CompletionNotifier) -> Self {
        let pipe_name = format!("{}{}", PIPE_NAME_PREFIX, Uuid::new_v4());
        let full_pipe_name = endpoint::address_for(&pipe_name);

        Self {
            session: Arc::new(Session::new(notifier)),
            pipe_name,
            full_pipe_name,
            runtime: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
            shutdown_complete_rx: Mutex::new(None),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Short pipe name, unique per server.
    pub fn pipe_name(&self) -> &str {
        &self.pipe_name
    }

    /// Address handed to the external process on its command line.
    pub fn full_pipe_name(&self) -> &str {
        &self.full_pipe_name
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_configurable(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(BridgeError::StateViolation("session already disposed"));
        }
        if self.is_started() {
            return Err(BridgeError::StateViolation(
                "layers cannot change after the session started",
            ));
        }
        Ok(())
    }

    /// Append layers below the ones already added. Only before [`start`](Self::start).
    pub fn add_layers<I>(&self, layers: I) -> Result<()>
    where
        I: IntoIterator<Item = Layer>,
    {
        self.ensure_configurable()?;
        self.session.layers().extend(layers);
        Ok(())
    }

    /// Replace the whole collection, active index included.
    pub fn set_layers(&self, collection: LayerCollection) -> Result<()> {
        self.ensure_configurable()?;
        *self.session.layers() = collection;
        Ok(())
    }

    /// Mark the layer at `index` (top-to-bottom) as active. The layer must already be added.
    pub fn set_active_index(&self, index: usize) -> Result<()> {
        self.ensure_configurable()?;
        let mut layers = self.session.layers();
        if index >= layers.len() {
            return Err(BridgeError::StateViolation(
                "active layer index is out of range",
            ));
        }
        layers.set_active_index(index);
        Ok(())
    }

    pub fn layer_count(&self) -> usize {
        self.session.layers().len()
    }

    /// Read the layer collection under the session lock.
    pub fn inspect_layers<R>(&self, inspect: impl FnOnce(&LayerCollection) -> R) -> R {
        inspect(&self.session.layers())
    }

    /// Copy of the active layer, which a successful output replaces.
    pub fn active_layer_surface(&self) -> Option<Surface> {
        self.session.layers().active().map(|layer| layer.surface().clone())
    }

    /// Create the pipe and begin serving. Fails when called twice or after disposal.
    pub fn start(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(BridgeError::StateViolation("session already disposed"));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::StateViolation("session already started"));
        }

        if let Err(e) = self.spawn_session() {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }

        info!(
            "[PIPE] Serving {} layer(s) on {}",
            self.layer_count(),
            self.full_pipe_name
        );
        Ok(())
    }

    fn spawn_session(&self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("gmic-bridge-pipe")
            .enable_all()
            .build()
            .map_err(|e| BridgeError::resource("Creating the pipe runtime", e))?;

        let endpoint = {
            let _guard = runtime.enter();
            PipeEndpoint::bind(&self.pipe_name).map_err(|e| {
                BridgeError::resource(format!("Creating pipe {}", self.full_pipe_name), e)
            })?
        };

        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (complete_tx, complete_rx) = std::sync::mpsc::channel();
        runtime.spawn(serve(
            endpoint,
            Arc::clone(&self.session),
            shutdown_rx,
            complete_tx,
        ));

        *self.shutdown_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(shutdown_tx);
        *self
            .shutdown_complete_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(complete_rx);
        *self.runtime.lock().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
        Ok(())
    }

    /// Receiver for output results published after this call.
    pub fn subscribe(&self) -> OutputReceiver {
        OutputReceiver::new(Arc::clone(self.session.output()))
    }

    /// Register a callback raised once per `output_images` exchange.
    pub fn on_output_image_changed<F>(&self, handler: F)
    where
        F: Fn(Arc<OutputImageState>) + Send + Sync + 'static,
    {
        self.session.notifier().subscribe(handler);
    }

    /// The most recent output state, if any.
    pub fn current_output(&self) -> Option<Arc<OutputImageState>> {
        self.session.output().current()
    }

    /// Error that stopped or disrupted the session, cleared by the call.
    pub fn take_session_error(&self) -> Option<BridgeError> {
        self.session.take_error()
    }

    /// Filter name last reported by the external process.
    pub fn gmic_command_name(&self) -> Option<String> {
        self.session.command_name()
    }

    /// Stop serving and release every owned resource. Safe to call repeatedly.
    pub fn dispose(&self) -> ReleaseSummary {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return ReleaseSummary::default();
        }

        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = tx.send(());
        }

        // Waiting from the pipe thread itself would deadlock.
        let on_runtime = tokio::runtime::Handle::try_current().is_ok();
        let complete_rx = self
            .shutdown_complete_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let (Some(rx), false) = (complete_rx, on_runtime) {
            if rx.recv_timeout(SHUTDOWN_GRACE).is_err() {
                warn!("[PIPE] Session loop did not stop in time");
            }
        }

        if let Some(runtime) = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            if on_runtime {
                runtime.shutdown_background();
            } else {
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
            }
        }

        let summary = self.session.release_all();
        self.session.set_phase(SessionPhase::Disposed);
        info!(
            "[PIPE] Disposed {}: {} layer(s), {} segment(s), {} output image(s) released",
            self.pipe_name, summary.layers, summary.segments, summary.output_images
        );
        summary
    }
}

impl Default for PipeServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PipeServer {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Accept, serve one request, wait for the ack, disconnect, repeat.
async fn serve(
    mut endpoint: PipeEndpoint,
    session: Arc<Session>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
    complete_tx: std::sync::mpsc::Sender<()>,
) {
    loop {
        session.set_phase(SessionPhase::WaitingForConnection);

        let stream = tokio::select! {
            accepted = endpoint.accept() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    error!("[PIPE] Waiting for a client failed: {}", e);
                    session.record_error(BridgeError::resource("Waiting for the filter engine", e));
                    session.set_phase(SessionPhase::Stopped);
                    break;
                }
            },
            _ = shutdown_rx.recv() => {
                debug!("[PIPE] Shutdown while waiting for a client");
                break;
            }
        };

        session.set_phase(SessionPhase::ServingRequest);
        let outcome = tokio::select! {
            outcome = exchange(stream, &session) => outcome,
            _ = shutdown_rx.recv() => {
                debug!("[PIPE] Shutdown during an exchange");
                break;
            }
        };

        match outcome {
            Ok(()) => {}
            Err(e @ BridgeError::ProtocolViolation(_)) => {
                error!("[PIPE] {}", e);
                session.record_error(e);
                session.set_phase(SessionPhase::Stopped);
                break;
            }
            Err(BridgeError::Io(e)) => {
                warn!("[PIPE] Client left the exchange: {}", e);
            }
            Err(e) => {
                error!("[SESSION] Request failed: {}", e);
                session.record_error(e);
            }
        }

        session.set_phase(SessionPhase::Restarting);
        if let Err(e) = endpoint.disconnect() {
            warn!("[PIPE] Disconnect failed: {}", e);
        }
    }

    let _ = complete_tx.send(());
}

async fn exchange(stream: &mut PipeStream, session: &Session) -> Result<()> {
    let payload = read_frame(stream).await?;
    let fields = decode_payload(&payload)?;
    let command = Command::decode(&fields)?;
    debug!("[PIPE] Request: {}", command.name());

    // Handlers copy pixels and may block on a completion dispatch.
    let reply = tokio::task::block_in_place(|| session.handle(command))?;

    write_frame(stream, &reply.encode()).await?;
    session.set_phase(SessionPhase::WaitingForClientAck);
    read_ack(stream).await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc::protocol::{encode_fields, ACK_SIZE};
    use crate::shm::{segment_path, SharedSegment, TransferUnit};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use std::path::Path;
    use std::time::Instant;

    /// Plays the external process: one connection per request.
    fn request(server: &PipeServer, fields: &[&str]) -> std::io::Result<Vec<String>> {
        let mut stream = UnixStream::connect(server.full_pipe_name())?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;

        let payload = encode_fields(fields);
        stream.write_all(&(payload.len() as i32).to_le_bytes())?;
        stream.write_all(&payload)?;

        let mut len = [0u8; 4];
        stream.read_exact(&mut len)?;
        let mut reply = vec![0u8; i32::from_le_bytes(len) as usize];
        stream.read_exact(&mut reply)?;
        stream.write_all(&[0u8; ACK_SIZE])?;

        Ok(decode_payload(&reply).unwrap())
    }

    fn wait_for_phase(server: &PipeServer, phase: SessionPhase) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if server.phase() == phase {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn layer(width: u32, height: u32, value: u8, visible: bool) -> Layer {
        let pixels = vec![value; width as usize * height as usize * 4];
        Layer::owned(Surface::from_bgra(width, height, pixels).unwrap(), visible)
    }

    fn started_server() -> PipeServer {
        let server = PipeServer::new();
        server
            .add_layers([layer(4, 4, 10, true), layer(6, 3, 20, false)])
            .unwrap();
        server.set_active_index(1).unwrap();
        server.start().unwrap();
        server
    }

    #[test]
    fn serves_a_full_filter_run() {
        let server = started_server();
        let mut receiver = server.subscribe();

        let size = request(&server, &["gmic_qt_get_max_layer_size", "mode=2"]).unwrap();
        assert_eq!(size, vec!["6,4"]);

        let units = request(
            &server,
            &["gmic_qt_get_cropped_images", "mode=1", "croprect=0,0,1,1"],
        )
        .unwrap();
        assert_eq!(units.len(), 1);
        let unit = TransferUnit::parse(&units[0]).unwrap();
        assert_eq!((unit.width, unit.height, unit.stride), (6, 3, 24));
        let input = std::fs::read(segment_path(&unit.name)).unwrap();
        assert!(input.iter().all(|&b| b == 20));

        let mut result = SharedSegment::create(2, 2, 8).unwrap();
        result.bytes_mut().fill(99);
        let layer_field = format!("layer={}", result.unit());
        let done = request(&server, &["gmic_qt_output_images", "mode=0", &layer_field]).unwrap();
        assert_eq!(done, vec!["done"]);

        let done = request(&server, &["gmic_qt_release_shared_memory"]).unwrap();
        assert_eq!(done, vec!["done"]);
        assert!(!segment_path(&unit.name).exists());

        let state = receiver
            .wait_next_timeout(Duration::from_secs(5))
            .expect("output published");
        let output = state.take().unwrap();
        assert_eq!(output.images.len(), 1);
        assert!(output.images[0].pixels().iter().all(|&b| b == 99));

        let active = server.active_layer_surface().unwrap();
        assert_eq!((active.width(), active.height()), (2, 2));
        assert!(server.take_session_error().is_none());
    }

    #[test]
    fn second_output_disposes_the_first() {
        let server = started_server();
        let mut receiver = server.subscribe();

        let submit = |value: u8| {
            let mut segment = SharedSegment::create(1, 1, 4).unwrap();
            segment.bytes_mut().fill(value);
            let field = format!("layer={}", segment.unit());
            request(&server, &["output_images", "mode=1", &field]).unwrap();
        };

        submit(1);
        let first = receiver.wait_next_timeout(Duration::from_secs(5)).unwrap();
        submit(2);
        let second = receiver.wait_next_timeout(Duration::from_secs(5)).unwrap();

        assert!(first.is_disposed());
        assert_eq!(second.generation(), first.generation() + 1);
        assert_eq!(second.take().unwrap().images[0].pixels(), &[2, 2, 2, 2]);
    }

    #[test]
    fn callbacks_fire_once_per_output() {
        let server = started_server();
        let (tx, rx) = std::sync::mpsc::channel();
        server.on_output_image_changed(move |state| {
            let _ = tx.send(state.generation());
        });

        let segment = SharedSegment::create(1, 1, 4).unwrap();
        let field = format!("layer={}", segment.unit());
        request(&server, &["output_images", "mode=0", &field]).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn unreadable_output_is_reported_through_the_state() {
        let server = started_server();
        let mut receiver = server.subscribe();

        let done = request(
            &server,
            &["output_images", "mode=0", "layer=gmic_bridge_missing,1,1,4"],
        )
        .unwrap();
        assert_eq!(done, vec!["done"]);

        let state = receiver.wait_next_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            state.take(),
            Err(BridgeError::ResourceFailure { .. })
        ));
        assert_eq!(server.active_layer_surface().map(|s| s.width()), Some(6));
    }

    #[test]
    fn protocol_violation_stops_the_session() {
        let server = started_server();
        assert!(request(&server, &["gmic_qt_get_max_layer_size"]).is_err());

        assert!(wait_for_phase(&server, SessionPhase::Stopped));
        assert!(matches!(
            server.take_session_error(),
            Some(BridgeError::ProtocolViolation(_))
        ));
        assert!(server.take_session_error().is_none());
    }

    #[test]
    fn empty_crop_fails_the_request_but_not_the_session() {
        let server = started_server();
        assert!(request(
            &server,
            &["gmic_qt_get_cropped_images", "mode=1", "croprect=1,0,0,1"],
        )
        .is_err());

        assert!(wait_for_phase(&server, SessionPhase::WaitingForConnection));
        assert!(matches!(
            server.take_session_error(),
            Some(BridgeError::ResourceFailure { .. })
        ));
        let size = request(&server, &["gmic_qt_get_max_layer_size", "mode=1"]).unwrap();
        assert_eq!(size, vec!["6,3"]);
    }

    #[test]
    fn command_name_is_exposed() {
        let server = started_server();
        request(&server, &["set_gmic_command_name", "Artistic / Cartoon"]).unwrap();
        assert_eq!(
            server.gmic_command_name().as_deref(),
            Some("Artistic / Cartoon")
        );
    }

    #[test]
    fn layers_are_frozen_after_start() {
        let server = started_server();
        assert!(matches!(
            server.add_layers([layer(1, 1, 0, true)]),
            Err(BridgeError::StateViolation(_))
        ));
        assert!(matches!(
            server.start(),
            Err(BridgeError::StateViolation(_))
        ));
        assert_eq!(server.layer_count(), 2);
    }

    #[test]
    fn active_index_must_name_an_added_layer() {
        let server = PipeServer::new();
        server.add_layers([layer(2, 2, 0, true)]).unwrap();
        assert!(matches!(
            server.set_active_index(1),
            Err(BridgeError::StateViolation(_))
        ));
        server.set_active_index(0).unwrap();
        assert_eq!(server.inspect_layers(|layers| layers.active_index()), 0);
    }

    #[test]
    fn dispose_releases_everything_once() {
        let server = started_server();
        let units = request(
            &server,
            &["get_cropped_images", "mode=2", "croprect=0,0,0.5,0.5"],
        )
        .unwrap();
        assert_eq!(units.len(), 2);
        let segment = TransferUnit::parse(&units[0]).unwrap().name;
        let socket = server.full_pipe_name().to_string();

        let summary = server.dispose();
        assert_eq!(summary.layers, 2);
        assert_eq!(summary.segments, 2);
        assert_eq!(server.phase(), SessionPhase::Disposed);
        assert!(!segment_path(&segment).exists());
        assert!(!Path::new(&socket).exists());

        assert_eq!(server.dispose(), ReleaseSummary::default());
        assert!(matches!(
            server.start(),
            Err(BridgeError::StateViolation(_))
        ));
    }

    #[test]
    fn dispose_releases_a_waiting_receiver() {
        let server = started_server();
        let mut receiver = server.subscribe();
        assert!(wait_for_phase(&server, SessionPhase::WaitingForConnection));

        let waiter = std::thread::spawn(move || receiver.wait_next());
        std::thread::sleep(Duration::from_millis(20));
        server.dispose();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn dispose_before_start_is_harmless() {
        let server = PipeServer::new();
        server.add_layers([layer(2, 2, 0, true)]).unwrap();
        assert_eq!(server.dispose().layers, 1);
    }
}
