//! Scripted collaborators for pipeline tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::PipelineConfig;
use crate::error::UpstreamError;
use crate::generation::{ContentRequest, PromptParams};
use crate::llm_client::{ContentService, StaticContentService};
use crate::orchestrator::{Collaborators, CourseOrchestrator};
use crate::prompts::PromptSet;
use crate::resources::{SpeechSynthesizer, SynthesizedAudio};
use crate::store::MemoryCourseStore;

/// Wraps [`StaticContentService`], counting calls and injecting latency,
/// stalls and failures per module index.
#[derive(Default)]
pub struct ScriptedService {
    inner: StaticContentService,
    latency: Duration,
    metadata_failure: Option<UpstreamError>,
    stalled: HashSet<usize>,
    /// Remaining rejections per module index.
    rejections: Mutex<HashMap<usize, usize>>,
    metadata_calls: AtomicUsize,
    module_calls: Mutex<HashMap<usize, usize>>,
}

impl ScriptedService {
    pub fn new(modules: usize) -> Self {
        Self {
            inner: StaticContentService::new(modules, 6),
            ..Self::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_metadata(mut self, err: UpstreamError) -> Self {
        self.metadata_failure = Some(err);
        self
    }

    /// Calls for this module never answer.
    pub fn stall_module(mut self, index: usize) -> Self {
        self.stalled.insert(index);
        self
    }

    /// The next `times` calls for this module are rejected as non-retryable.
    pub fn reject_module(self, index: usize, times: usize) -> Self {
        self.reject_next(index, times);
        self
    }

    /// Like [`reject_module`](Self::reject_module), on a service already in use.
    pub fn reject_next(&self, index: usize, times: usize) {
        self.rejections.lock().insert(index, times);
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn module_calls(&self, index: usize) -> usize {
        self.module_calls.lock().get(&index).copied().unwrap_or(0)
    }

    pub fn total_module_calls(&self) -> usize {
        self.module_calls.lock().values().sum()
    }
}

#[async_trait]
impl ContentService for ScriptedService {
    async fn complete(&self, request: &ContentRequest) -> Result<String, UpstreamError> {
        match &request.params {
            PromptParams::CourseMetadata(_) => {
                self.metadata_calls.fetch_add(1, Ordering::SeqCst);
                if let Some(err) = &self.metadata_failure {
                    return Err(err.clone());
                }
            }
            PromptParams::ModuleContent(params) => {
                let index = params.module_index;
                *self.module_calls.lock().entry(index).or_default() += 1;
                if self.stalled.contains(&index) {
                    std::future::pending::<()>().await;
                }
                let rejected = {
                    let mut rejections = self.rejections.lock();
                    match rejections.get_mut(&index) {
                        Some(remaining) if *remaining > 0 => {
                            *remaining -= 1;
                            true
                        }
                        _ => false,
                    }
                };
                if rejected {
                    return Err(UpstreamError::rejected(format!("module {index} rejected")));
                }
            }
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.inner.complete(request).await
    }
}

/// Speech that returns the text itself as audio, counting calls.
#[derive(Default)]
pub struct EchoSpeech {
    pub calls: AtomicUsize,
}

#[async_trait]
impl SpeechSynthesizer for EchoSpeech {
    async fn synthesize(&self, text: &str, language: &str) -> anyhow::Result<SynthesizedAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(SynthesizedAudio::Bytes(format!("{language}:{text}").into_bytes()))
    }
}

pub fn prompts() -> PromptSet {
    PromptSet {
        course_metadata: "plan a course".into(),
        module_content: "write a module".into(),
    }
}

/// An orchestrator over in-memory collaborators, plus its course store.
pub fn orchestrator(
    service: Arc<ScriptedService>,
    config: PipelineConfig,
) -> (CourseOrchestrator, Arc<MemoryCourseStore>) {
    let store = Arc::new(MemoryCourseStore::new());
    let mut collaborators = Collaborators::in_memory(service, prompts(), &config);
    collaborators.courses = store.clone();
    (CourseOrchestrator::new(config, collaborators), store)
}
