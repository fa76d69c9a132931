//! Tool-call execution: the agent's restricted action surface.
//!
//! The model emits a JSON array of tool invocations drawn from a fixed,
//! schema-validated set; the host executes them against the workspace and
//! repo adapter and reports an outcome declaring `files_written`. Nothing
//! here ever commits to the repo: `write_file` changes the workspace only.

pub mod executor;
pub mod protocol;

pub use executor::{ExecutorDeps, ToolExecutor};
pub use protocol::{parse_tool_batch, BatchOutcome, ErrorType, ToolInvocation, ToolOutcome};
