//! Delegated processing of one email.
//!
//! Every delegated email flows through:
//! 1. `ToolGateway::extract()`: discover items (once per run)
//! 2. `ToolGateway::validate()`: per item, may reject
//! 3. `ToolGateway::schedule()`: per validated item, idempotent
//!
//! Transactional mail skips all of this and goes to the `DirectHandler`.

pub mod category;
pub mod direct;
pub mod extract;
pub mod gateway;
pub mod retry;
pub mod types;
pub mod validate;

pub use category::{CategoryPipeline, ItemPipeline, PipelineRegistry};
pub use direct::{DirectHandler, DirectOutcome};
pub use gateway::{ToolCall, ToolGateway, parse_tool_call};
pub use retry::RetryPolicy;
pub use types::{ItemOutcome, ItemState, PipelineRun};
