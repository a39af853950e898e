// Raises `OutputImageChanged` through the configured execution context.

use super::context::{CompletionDispatch, ExecutionContext, Immediate};
use super::state::OutputImageState;
use log::debug;
use std::sync::{Arc, Mutex, PoisonError};

pub type OutputImageChanged = Arc<dyn Fn(Arc<OutputImageState>) + Send + Sync>;

/// Subscribers to completed output submissions.
pub struct CompletionNotifier {
    context: Arc<dyn ExecutionContext>,
    dispatch: CompletionDispatch,
    handlers: Mutex<Vec<OutputImageChanged>>,
}

impl CompletionNotifier {
    /// Callbacks run directly on the pipe thread.
    pub fn direct() -> Self {
        Self::new(Arc::new(Immediate), CompletionDispatch::Send)
    }

    pub fn new(context: Arc<dyn ExecutionContext>, dispatch: CompletionDispatch) -> Self {
        Self {
            context,
            dispatch,
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback for every completed output submission.
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(Arc<OutputImageState>) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    /// Drop every registered callback.
    pub fn clear(&self) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Deliver `state` to every subscriber.
    pub fn notify(&self, state: Arc<OutputImageState>) {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if handlers.is_empty() {
            return;
        }

        debug!(
            "[NOTIFY] Output #{} to {} subscriber(s) via {:?}",
            state.generation(),
            handlers.len(),
            self.dispatch
        );

        let job = Box::new(move || {
            for handler in &handlers {
                handler(Arc::clone(&state));
            }
        });

        match self.dispatch {
            CompletionDispatch::Send => self.context.send(job),
            CompletionDispatch::Post => self.context.post(job),
        }
    }
}

impl Default for CompletionNotifier {
    fn default() -> Self {
        Self::direct()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::OutputMode;
    use crate::output::context::DispatchQueue;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn state(generation: u64) -> Arc<OutputImageState> {
        Arc::new(OutputImageState::success(
            generation,
            OutputMode::InPlace,
            Vec::new(),
        ))
    }

    #[test]
    fn direct_notifier_calls_subscribers() {
        let notifier = CompletionNotifier::direct();
        let last = Arc::new(AtomicU64::new(0));
        let l = Arc::clone(&last);
        notifier.subscribe(move |state| l.store(state.generation(), Ordering::SeqCst));

        notifier.notify(state(7));
        assert_eq!(last.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn posted_notifications_wait_for_the_queue() {
        let queue = Arc::new(DispatchQueue::new());
        let notifier = CompletionNotifier::new(queue.clone(), CompletionDispatch::Post);
        let last = Arc::new(AtomicU64::new(0));
        let l = Arc::clone(&last);
        notifier.subscribe(move |state| l.store(state.generation(), Ordering::SeqCst));

        notifier.notify(state(3));
        assert_eq!(last.load(Ordering::SeqCst), 0);
        queue.run_pending();
        assert_eq!(last.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cleared_notifier_is_silent() {
        let notifier = CompletionNotifier::direct();
        let last = Arc::new(AtomicU64::new(0));
        let l = Arc::clone(&last);
        notifier.subscribe(move |state| l.store(state.generation(), Ordering::SeqCst));
        notifier.clear();
        notifier.notify(state(1));
        assert_eq!(last.load(Ordering::SeqCst), 0);
    }
}
