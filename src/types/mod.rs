//! Public types for the Hyphae API.

mod message;
mod model;
mod response;

pub use message::{Message, Role, prompt_of};
pub use model::{ModelBadge, ModelInfo};
pub use response::{AiResponse, Completion, ResponseMetadata, StreamEvent, TokenCounts, Usage};
