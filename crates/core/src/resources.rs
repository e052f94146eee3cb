//! Supplementary Resources
//!
//! Collaborator interfaces for video search, speech synthesis and media
//! storage, and the two helpers that drive them. Every failure here is
//! degraded: a module with no videos, or a chunk with no narration, is still
//! deliverable.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::course::{AudioResource, ExperienceLevel, VideoReference, checksum};

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("{what} timed out after {}ms", .after.as_millis())]
    Timeout { what: &'static str, after: Duration },
    #[error("video search failed: {0:#}")]
    VideoSearch(anyhow::Error),
    #[error("speech synthesis failed: {0:#}")]
    Speech(anyhow::Error),
    #[error("object store failed: {0:#}")]
    ObjectStore(anyhow::Error),
    #[error("speech synthesis is not configured")]
    SpeechUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoQuery {
    pub keywords: Vec<String>,
    pub level: ExperienceLevel,
    pub max_results: usize,
}

impl VideoQuery {
    /// Keywords joined into a single search string.
    pub fn text(&self) -> String {
        self.keywords.join(" ")
    }
}

#[async_trait]
pub trait VideoSearch: Send + Sync {
    /// Videos matching `query`, best match first.
    async fn search(&self, query: &VideoQuery) -> Result<Vec<VideoReference>>;
}

/// What a speech synthesizer hands back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesizedAudio {
    /// Raw audio to be written to the object store.
    Bytes(Vec<u8>),
    /// The synthesizer already stored the audio; this is its reference.
    Stored(String),
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, language: &str) -> Result<SynthesizedAudio>;
}

/// Media storage. Only used for synthesized audio.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn write(&self, bytes: Vec<u8>) -> Result<String>;
    async fn read(&self, reference: &str) -> Result<Vec<u8>>;
}

fn content_address(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Object store held in process memory, addressed by content hash.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn write(&self, bytes: Vec<u8>) -> Result<String> {
        let reference = content_address(&bytes);
        self.objects.lock().insert(reference.clone(), bytes);
        Ok(reference)
    }

    async fn read(&self, reference: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .get(reference)
            .cloned()
            .with_context(|| format!("object '{reference}' not found"))
    }
}

/// Object store writing one file per object under a root directory.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, reference: &str) -> Result<PathBuf> {
        if reference.is_empty() || !reference.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("invalid object reference '{reference}'");
        }
        Ok(self.root.join(reference))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn write(&self, bytes: Vec<u8>) -> Result<String> {
        let reference = content_address(&bytes);
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))?;
        let path = self.path_for(&reference)?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(reference)
    }

    async fn read(&self, reference: &str) -> Result<Vec<u8>> {
        let path = self.path_for(reference)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }
}

/// Looks up videos for a module, bounded by a timeout.
pub struct ResourceResolver {
    search: Option<Arc<dyn VideoSearch>>,
    timeout: Duration,
    max_videos: usize,
}

impl ResourceResolver {
    pub fn new(search: Option<Arc<dyn VideoSearch>>, timeout: Duration, max_videos: usize) -> Self {
        Self {
            search,
            timeout,
            max_videos,
        }
    }

    /// Videos for `query`; empty when search is not configured or fails.
    pub async fn videos_for(&self, query: &VideoQuery) -> Vec<VideoReference> {
        match self.try_videos_for(query).await {
            Ok(videos) => videos,
            Err(err) => {
                warn!(query = %query.text(), error = %err, "Video lookup failed, continuing without videos");
                Vec::new()
            }
        }
    }

    async fn try_videos_for(&self, query: &VideoQuery) -> Result<Vec<VideoReference>, ResourceError> {
        let Some(search) = &self.search else {
            return Ok(Vec::new());
        };
        let query = VideoQuery {
            max_results: query.max_results.min(self.max_videos),
            ..query.clone()
        };
        let mut videos = tokio::time::timeout(self.timeout, search.search(&query))
            .await
            .map_err(|_| ResourceError::Timeout {
                what: "video search",
                after: self.timeout,
            })?
            .map_err(ResourceError::VideoSearch)?;
        videos.truncate(query.max_results);
        debug!(query = %query.text(), found = videos.len(), "Resolved videos");
        Ok(videos)
    }
}

/// Turns text into stored narration.
pub struct Narrator {
    speech: Option<Arc<dyn SpeechSynthesizer>>,
    objects: Arc<dyn ObjectStore>,
}

impl Narrator {
    pub fn new(speech: Option<Arc<dyn SpeechSynthesizer>>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { speech, objects }
    }

    pub fn is_available(&self) -> bool {
        self.speech.is_some()
    }

    pub async fn narrate(&self, text: &str, language: &str) -> Result<AudioResource, ResourceError> {
        let speech = self.speech.as_ref().ok_or(ResourceError::SpeechUnavailable)?;
        let reference = match speech
            .synthesize(text, language)
            .await
            .map_err(ResourceError::Speech)?
        {
            SynthesizedAudio::Bytes(bytes) => self
                .objects
                .write(bytes)
                .await
                .map_err(ResourceError::ObjectStore)?,
            SynthesizedAudio::Stored(reference) => reference,
        };
        Ok(AudioResource {
            reference,
            language: language.to_string(),
            checksum: checksum(text),
        })
    }

    /// Stored audio bytes for a reference returned by [`Narrator::narrate`].
    pub async fn audio(&self, reference: &str) -> Result<Vec<u8>, ResourceError> {
        self.objects
            .read(reference)
            .await
            .map_err(ResourceError::ObjectStore)
    }
}
