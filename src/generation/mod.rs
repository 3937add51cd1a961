//! Content generation: prompt construction, the upstream model client and
//! the quota-aware orchestration around it.

pub mod client;
pub mod content;
pub mod handlers;
mod orchestrator;

pub use client::{ContentGenerator, GeminiClient};
pub use content::{build_prompt, parse_generated, Caption, CaptionStyle, GeneratedContent, GenerationSettings};
pub use orchestrator::{GenerationOrchestrator, GenerationOutcome};
