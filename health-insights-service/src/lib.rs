pub mod gemini;
pub mod models;
pub mod service;

pub use gemini::GeminiClient;
pub use service::{AppState, build_router};
