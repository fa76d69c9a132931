//! Append-only event stream for agent runs.

pub mod stream;
pub mod types;

pub use stream::EventStream;
pub use types::{AgentEvent, EventType};
