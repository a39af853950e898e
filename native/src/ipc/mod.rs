// IPC with the external filter process: a local pipe carrying one
// length-prefixed request per connection, acknowledged by the client.

pub mod endpoint;
pub mod handler;
pub mod protocol;
pub mod server;

pub use handler::{ReleaseSummary, SessionPhase};
pub use protocol::{Command, OutputMode, Reply};
pub use server::PipeServer;
