//! Foreground chat: streaming agentic loop with tools, loop detection,
//! interruption, and durable ask_user pauses.

mod describe;
mod handler;
mod runtime;

pub use describe::describe_tool_call;
pub use handler::{ChatHandler, ChatLoopState, ChatRequest};
pub use runtime::{RuntimeContext, RuntimeContextCache};
