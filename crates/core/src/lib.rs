//! Course generation pipeline.
//!
//! A learner asks for a course on a topic; the [`orchestrator`] returns its
//! outline and first module quickly, then fills in the rest in the background
//! while callers read modules, subscribe to [`progress`] and request
//! replacements. Generated content is deduplicated by the [`cache`], keyed by
//! [`fingerprint`]s of the request.

pub mod builder;
pub mod cache;
pub mod chunker;
pub mod config;
pub mod course;
pub mod error;
pub mod fingerprint;
pub mod generation;
pub mod llm_client;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod resources;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::PipelineConfig;
pub use course::{Course, CourseId, GenerationRequest, Module, ModuleSlot};
pub use error::{CourseError, GenerationError};
pub use orchestrator::{
    Collaborators, CourseOrchestrator, HealthReport, HealthStatus, ModuleFetch, ReplacementScope,
};
pub use progress::{ProgressEvent, ProgressStream};
