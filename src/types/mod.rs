//! Normalized request/response data model shared by every gateway stage.

pub mod message;
pub mod request;
pub mod response;
pub mod tool;

pub use message::{Message, MessageRole};
pub use request::{ChatRequest, GenerationParams, ModelTarget, RequestInput};
pub use response::{ChatResponse, Choice, FinishReason, ResponseMessage, ResponseMeta, Usage};
pub use tool::{FunctionDefinition, ToolCall, ToolDefinition};
