//! Course Data Model
//!
//! Requests, course metadata, modules and their chunks, and the per-index
//! module slots that make up a course while it is still being generated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::CourseError;

/// Opaque, globally unique course identifier.
pub type CourseId = Uuid;

/// Longest accepted topic, in characters.
pub const MAX_TOPIC_CHARS: usize = 500;
/// Most personalization tags accepted on a single request.
pub const MAX_TAGS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExperienceLevel {
    Beginner,
    Intermediate,
    Advanced,
}

impl ExperienceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperienceLevel::Beginner => "beginner",
            ExperienceLevel::Intermediate => "intermediate",
            ExperienceLevel::Advanced => "advanced",
        }
    }
}

impl fmt::Display for ExperienceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Personality {
    #[default]
    Friendly,
    Formal,
    Motivational,
    Humorous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningStyle {
    Visual,
    #[default]
    Reading,
    Practical,
    Auditory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Light,
    #[default]
    Moderate,
    Intensive,
}

/// How the generated material should read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StyleParameters {
    #[serde(default)]
    pub personality: Personality,
    #[serde(default)]
    pub learning_style: LearningStyle,
    #[serde(default)]
    pub intensity: Intensity,
}

/// A learner's request for a course.
///
/// Treated as immutable once accepted: fingerprints for cached content are
/// derived from its normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub topic: String,
    pub level: ExperienceLevel,
    /// Personalization tags (interests), e.g. "sports".
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub style: StyleParameters,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>, level: ExperienceLevel) -> Self {
        Self {
            topic: topic.into(),
            level,
            tags: BTreeSet::new(),
            style: StyleParameters::default(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_style(mut self, style: StyleParameters) -> Self {
        self.style = style;
        self
    }

    /// Basic shape checks, run before any external call is made.
    pub fn validate(&self) -> Result<(), CourseError> {
        let topic = self.topic.trim();
        if topic.is_empty() {
            return Err(CourseError::Validation("topic must not be empty".into()));
        }
        if topic.chars().count() > MAX_TOPIC_CHARS {
            return Err(CourseError::Validation(format!(
                "topic must be at most {MAX_TOPIC_CHARS} characters"
            )));
        }
        if self.tags.len() > MAX_TAGS {
            return Err(CourseError::Validation(format!(
                "at most {MAX_TAGS} personalization tags are allowed"
            )));
        }
        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(CourseError::Validation(
                "personalization tags must not be blank".into(),
            ));
        }
        Ok(())
    }

    /// Case- and whitespace-insensitive form used to derive cache keys.
    pub fn normalized(&self) -> GenerationRequest {
        GenerationRequest {
            topic: collapse_whitespace(&self.topic).to_lowercase(),
            level: self.level,
            tags: self
                .tags
                .iter()
                .map(|tag| collapse_whitespace(tag).to_lowercase())
                .filter(|tag| !tag.is_empty())
                .collect(),
            style: self.style,
        }
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Course-level description produced once, when the course is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseMetadata {
    pub title: String,
    pub description: String,
    pub level: ExperienceLevel,
    pub estimated_duration_hours: u32,
    /// Module outline, in teaching order.
    pub module_titles: Vec<String>,
    pub topics: Vec<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
}

impl CourseMetadata {
    pub fn module_count(&self) -> usize {
        self.module_titles.len()
    }

    /// The outline entry at `index`, with its neighbours as prior/next context.
    pub fn outline_entry(&self, index: usize) -> Option<OutlineEntry> {
        let title = self.module_titles.get(index)?.clone();
        Some(OutlineEntry {
            index,
            title,
            previous: index
                .checked_sub(1)
                .and_then(|prev| self.module_titles.get(prev).cloned()),
            next: self.module_titles.get(index + 1).cloned(),
        })
    }
}

/// One entry of the module outline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutlineEntry {
    pub index: usize,
    pub title: String,
    pub previous: Option<String>,
    pub next: Option<String>,
}

/// Lower-case hex SHA-256 of `content`.
pub fn checksum(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// A bounded segment of a module's body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleChunk {
    pub content: String,
    /// Zero-based position within the module.
    pub order: usize,
    /// Number of chunks in the module.
    pub total: usize,
    pub checksum: String,
}

impl ModuleChunk {
    pub fn new(content: String, order: usize, total: usize) -> Self {
        let checksum = checksum(&content);
        Self {
            content,
            order,
            total,
            checksum,
        }
    }

    /// Whether the content still matches its checksum.
    pub fn is_intact(&self) -> bool {
        checksum(&self.content) == self.checksum
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    pub options: Vec<String>,
    /// Index into `options`.
    pub correct_option: usize,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoReference {
    pub title: String,
    pub external_id: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextLink {
    pub title: String,
    pub url: String,
}

/// Synthesized narration stored in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioResource {
    pub reference: String,
    pub language: String,
    /// Checksum of the narrated text.
    pub checksum: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleResources {
    #[serde(default)]
    pub videos: Vec<VideoReference>,
    #[serde(default)]
    pub links: Vec<TextLink>,
    #[serde(default)]
    pub audio: Vec<AudioResource>,
}

/// A fully generated module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub title: String,
    pub description: String,
    pub objective: String,
    pub concepts: Vec<String>,
    pub chunks: Vec<ModuleChunk>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub quiz: Vec<QuizQuestion>,
    #[serde(default)]
    pub resources: ModuleResources,
    /// 0 for the original build; incremented by each replacement.
    #[serde(default)]
    pub revision: u32,
}

impl Module {
    /// The generated body, reassembled from its chunks.
    pub fn body(&self) -> String {
        self.chunks.iter().map(|chunk| chunk.content.as_str()).collect()
    }

    /// Checks that chunks are gap-free, ordered, agree on the total and
    /// match their checksums.
    pub fn verify_chunks(&self) -> bool {
        let total = self.chunks.len();
        self.chunks
            .iter()
            .enumerate()
            .all(|(i, chunk)| chunk.order == i && chunk.total == total && chunk.is_intact())
    }
}

/// Generation state of one module index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModuleSlot {
    Empty,
    Pending,
    Ready { module: Arc<Module> },
    Failed { reason: String },
}

impl ModuleSlot {
    pub fn is_ready(&self) -> bool {
        matches!(self, ModuleSlot::Ready { .. })
    }

    /// Ready or failed: no generation is expected to change it.
    pub fn is_settled(&self) -> bool {
        matches!(self, ModuleSlot::Ready { .. } | ModuleSlot::Failed { .. })
    }

    pub fn module(&self) -> Option<&Arc<Module>> {
        match self {
            ModuleSlot::Ready { module } => Some(module),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseStatus {
    Generating,
    PartiallyReady,
    Ready,
    Failed,
}

impl CourseStatus {
    /// Status as seen from the slots alone.
    ///
    /// A course is `ready` once every slot has settled, even if some of them
    /// failed; it is `failed` only if none of them produced a module.
    pub fn from_slots(slots: &[ModuleSlot]) -> Self {
        let ready = slots.iter().filter(|slot| slot.is_ready()).count();
        let unsettled = slots.iter().filter(|slot| !slot.is_settled()).count();
        match (unsettled, ready) {
            (0, 0) => CourseStatus::Failed,
            (0, _) => CourseStatus::Ready,
            (_, 0) => CourseStatus::Generating,
            _ => CourseStatus::PartiallyReady,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CourseStatus::Ready | CourseStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CourseStatus::Generating => "generating",
            CourseStatus::PartiallyReady => "partially_ready",
            CourseStatus::Ready => "ready",
            CourseStatus::Failed => "failed",
        }
    }
}

/// Position of a course in its generation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoursePhase {
    Created,
    MetadataReady,
    FirstModuleReady,
    GeneratingBackground,
    PartiallyReady,
    Ready,
    Failed,
}

/// Point-in-time view of a course, and its durable representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub request: GenerationRequest,
    pub metadata: CourseMetadata,
    pub status: CourseStatus,
    pub phase: CoursePhase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub slots: Vec<ModuleSlot>,
}

impl Course {
    pub fn module(&self, index: usize) -> Option<&Arc<Module>> {
        self.slots.get(index).and_then(ModuleSlot::module)
    }

    pub fn ready_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_ready()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, ModuleSlot::Failed { .. }))
            .count()
    }
}

/// Share of `slots` that hold a ready module, as a whole percentage.
pub fn progress_percent(slots: &[ModuleSlot]) -> u8 {
    if slots.is_empty() {
        return 0;
    }
    let ready = slots.iter().filter(|slot| slot.is_ready()).count();
    ((ready * 100) / slots.len()) as u8
}
