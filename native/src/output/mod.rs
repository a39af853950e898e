//! Output image state and completion signaling.

pub mod context;
pub mod notifier;
pub mod state;

pub use context::{CompletionDispatch, DispatchQueue, ExecutionContext, Immediate, Job};
pub use notifier::{CompletionNotifier, OutputImageChanged};
pub use state::{OutputImageState, OutputImages, OutputReceiver, OutputSlot};
