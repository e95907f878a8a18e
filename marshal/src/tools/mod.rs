//! Tool definitions, extraction, and execution for the agentic loops.

mod executor;
pub mod parse;
mod spec;

pub use executor::{clamp_result, CodingDispatcher, NoCodingDispatcher, ToolExecutor, ToolOutcome};
pub use parse::{extract_tool_calls, lenient_json, ExtractedCalls};
pub use spec::{
    approx_chars, background_toolset, chat_toolset, load_tool_specs, to_wire, ToolSpec,
    ToolSpecError,
};
