//! Orchestrator and its builder

mod builder;
mod orchestrator;
mod request;
mod stream;

pub use builder::{Hyphae, HyphaeBuilder};
pub use orchestrator::Orchestrator;
pub use request::GenerateRequest;
pub use stream::AccountedStream;
