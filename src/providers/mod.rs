//! Provider capability and implementations.

pub mod backpressure;
pub mod openai;
pub mod set;
pub mod traits;

pub use backpressure::{DEFAULT_STREAM_BUFFER, bounded_stream};
pub use openai::OpenAiCompatProvider;
pub use set::ProviderSet;
pub use traits::{CompletionProvider, CompletionRequest, CompletionStream};
