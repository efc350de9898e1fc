//! Prompt templates
//!
//! Templates load from an optional directory and fall back to embedded
//! defaults. Each resolved template gets a content address at load time;
//! metrics attribution carries the prompt key + CID so every work unit can
//! be traced back to the exact prompt text that produced it.

pub mod embedded;
mod loader;

pub use loader::{Prompt, PromptSet};
