//! API Models
//!
//! Request and response bodies of the REST API. Core types that appear in
//! responses are documented as opaque objects in the OpenAPI schema.

use chrono::{DateTime, Utc};
use coursegen_core::course::{
    AudioResource, Course, CourseMetadata, CoursePhase, CourseStatus, ExperienceLevel,
    GenerationRequest, Module, ModuleSlot, StyleParameters, progress_percent,
};
use coursegen_core::{HealthReport, HealthStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateCoursePayload {
    #[schema(example = "basic statistics")]
    pub topic: String,
    #[schema(value_type = String, example = "beginner")]
    pub level: ExperienceLevel,
    /// Interests to draw examples from.
    #[serde(default)]
    #[schema(example = json!(["sports"]))]
    pub tags: Vec<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub style: StyleParameters,
}

impl CreateCoursePayload {
    pub fn into_request(self) -> GenerationRequest {
        GenerationRequest::new(self.topic, self.level)
            .with_tags(self.tags)
            .with_style(self.style)
    }
}

/// One slot of the course outline.
#[derive(Debug, Serialize, ToSchema)]
pub struct SlotSummary {
    pub index: usize,
    pub title: String,
    #[schema(example = "ready")]
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<u32>,
}

fn slot_state(slot: &ModuleSlot) -> &'static str {
    match slot {
        ModuleSlot::Empty => "empty",
        ModuleSlot::Pending => "pending",
        ModuleSlot::Ready { .. } => "ready",
        ModuleSlot::Failed { .. } => "failed",
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CourseResponse {
    #[schema(value_type = String, format = Uuid)]
    pub course_id: Uuid,
    #[schema(value_type = String, example = "partially_ready")]
    pub status: CourseStatus,
    #[schema(value_type = String, example = "generating_background")]
    pub phase: CoursePhase,
    pub progress_percent: u8,
    #[schema(value_type = Object)]
    pub metadata: CourseMetadata,
    /// Module 0, when it is ready.
    #[schema(value_type = Option<Object>)]
    pub first_module: Option<Arc<Module>>,
    pub slots: Vec<SlotSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Course> for CourseResponse {
    fn from(course: &Course) -> Self {
        let slots = course
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotSummary {
                index,
                title: course
                    .metadata
                    .module_titles
                    .get(index)
                    .cloned()
                    .unwrap_or_default(),
                state: slot_state(slot).to_string(),
                reason: match slot {
                    ModuleSlot::Failed { reason } => Some(reason.clone()),
                    _ => None,
                },
                revision: slot.module().map(|module| module.revision),
            })
            .collect();
        Self {
            course_id: course.id,
            status: course.status,
            phase: course.phase,
            progress_percent: progress_percent(&course.slots),
            metadata: course.metadata.clone(),
            first_module: course.module(0).cloned(),
            slots,
            created_at: course.created_at,
            updated_at: course.updated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ModuleResponse {
    pub index: usize,
    #[schema(value_type = Object)]
    pub module: Arc<Module>,
}

/// Returned with 202 while a module is still being built.
#[derive(Debug, Serialize, ToSchema)]
pub struct GeneratingResponse {
    pub index: usize,
    #[schema(example = "generating")]
    pub status: String,
}

impl GeneratingResponse {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            status: "generating".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ModuleQuery {
    /// Wait up to this many milliseconds for a module being built elsewhere.
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ReplaceModulePayload {
    /// Rewrite the module without this concept instead of regenerating it.
    #[serde(default)]
    #[schema(example = "mean")]
    pub concept: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct NarratePayload {
    #[serde(default = "default_language")]
    #[schema(example = "en")]
    pub language: String,
}

impl Default for NarratePayload {
    fn default() -> Self {
        Self {
            language: default_language(),
        }
    }
}

fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AudioResponse {
    pub reference: String,
    pub language: String,
    pub checksum: String,
    /// Where the audio can be fetched.
    #[schema(example = "/audio/3f2a...")]
    pub url: String,
}

impl From<AudioResource> for AudioResponse {
    fn from(audio: AudioResource) -> Self {
        Self {
            url: format!("/audio/{}", audio.reference),
            reference: audio.reference,
            language: audio.language,
            checksum: audio.checksum,
        }
    }
}

/// Reachability of the backing stores.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// `healthy`, `degraded` (cache unreachable) or `unhealthy` (course store unreachable).
    #[schema(example = "healthy")]
    pub status: String,
    #[schema(example = "connected")]
    pub database: String,
    #[schema(example = "connected")]
    pub cache: String,
}

impl From<HealthReport> for HealthResponse {
    fn from(report: HealthReport) -> Self {
        let connection = |up: bool| (if up { "connected" } else { "disconnected" }).to_string();
        let status = match report.status {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        Self {
            status: status.to_string(),
            database: connection(report.store),
            cache: connection(report.cache),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StartResponse {
    #[schema(value_type = String, format = Uuid)]
    pub course_id: Uuid,
    /// Modules newly scheduled for background generation.
    pub scheduled: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}
