pub mod ollama;
pub mod service;

pub use ollama::OllamaClient;
pub use service::{Busy, ExplainRequest, ExplanationConfig, ExplanationService};
