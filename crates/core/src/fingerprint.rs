//! Cache keys for generated content.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::course::GenerationRequest;

/// Which piece of a course a cached payload belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    Metadata,
    Module {
        index: usize,
        title: String,
    },
    /// A regenerated module. `revision` keeps successive replacements of the
    /// same slot apart from each other and from the original build.
    Replacement {
        index: usize,
        title: String,
        revision: u32,
        without: Option<String>,
    },
}

impl Stage {
    pub fn tag(&self) -> String {
        match self {
            Stage::Metadata => "metadata".to_string(),
            Stage::Module { index, title } => format!("module:{index}:{title}"),
            Stage::Replacement {
                index,
                title,
                revision,
                without,
            } => {
                let mut tag = format!("module:{index}:{title}:replace:{revision}");
                if let Some(concept) = without {
                    tag.push_str(":without:");
                    tag.push_str(&concept.trim().to_lowercase());
                }
                tag
            }
        }
    }
}

/// Stable hex key identifying one generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Key for `stage` of the course described by `request`.
    ///
    /// Requests that differ only in case, spacing or tag order map to the
    /// same key.
    pub fn of(request: &GenerationRequest, stage: &Stage) -> Self {
        let normalized = request.normalized();
        let mut hasher = Sha256::new();
        write_field(&mut hasher, normalized.topic.as_bytes());
        write_field(&mut hasher, normalized.level.as_str().as_bytes());
        for tag in &normalized.tags {
            write_field(&mut hasher, tag.as_bytes());
        }
        // Style enums serialize to plain strings, so this cannot fail.
        let style = serde_json::to_vec(&normalized.style).unwrap_or_default();
        write_field(&mut hasher, &style);
        write_field(&mut hasher, stage.tag().as_bytes());
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    /// Key for narration of a chunk. Independent of any course.
    pub fn narration(chunk_checksum: &str, language: &str) -> Self {
        let mut hasher = Sha256::new();
        write_field(
            &mut hasher,
            format!("audio:{chunk_checksum}:{}", language.trim().to_lowercase()).as_bytes(),
        );
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Length-prefixed so adjacent fields cannot run into each other.
fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}
