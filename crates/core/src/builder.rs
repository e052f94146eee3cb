//! Module Builder
//!
//! Turns one outline entry into a [`Module`]: generate the body, chunk it,
//! then look up videos. The finished module is cached as a whole, so a
//! repeat build of the same entry costs nothing.

use std::sync::Arc;
use tracing::debug;

use crate::cache::ContentCache;
use crate::chunker::Chunker;
use crate::course::{
    CourseMetadata, GenerationRequest, Module, ModuleResources, OutlineEntry,
};
use crate::error::GenerationError;
use crate::fingerprint::{Fingerprint, Stage};
use crate::generation::{Criticality, GenerationClient, ModuleParams};
use crate::resources::{ResourceResolver, VideoQuery};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub criticality: Criticality,
    /// 0 builds the original module; anything higher is a replacement.
    pub revision: u32,
    /// Concept the learner already knows, left out of a replacement.
    pub exclude_concept: Option<String>,
}

impl BuildOptions {
    pub fn original(criticality: Criticality) -> Self {
        Self {
            criticality,
            revision: 0,
            exclude_concept: None,
        }
    }

    pub fn replacement(revision: u32, exclude_concept: Option<String>) -> Self {
        Self {
            criticality: Criticality::OnDemand,
            revision,
            exclude_concept,
        }
    }

    fn stage(&self, entry: &OutlineEntry) -> Stage {
        if self.revision == 0 {
            Stage::Module {
                index: entry.index,
                title: entry.title.clone(),
            }
        } else {
            Stage::Replacement {
                index: entry.index,
                title: entry.title.clone(),
                revision: self.revision,
                without: self.exclude_concept.clone(),
            }
        }
    }
}

pub struct ModuleBuilder {
    client: Arc<GenerationClient>,
    cache: ContentCache,
    chunker: Chunker,
    resources: ResourceResolver,
    max_videos: usize,
}

impl ModuleBuilder {
    pub fn new(
        client: Arc<GenerationClient>,
        cache: ContentCache,
        chunker: Chunker,
        resources: ResourceResolver,
        max_videos: usize,
    ) -> Self {
        Self {
            client,
            cache,
            chunker,
            resources,
            max_videos,
        }
    }

    pub async fn build(
        &self,
        request: &GenerationRequest,
        metadata: &CourseMetadata,
        entry: &OutlineEntry,
        options: BuildOptions,
    ) -> Result<Module, GenerationError> {
        let fingerprint = Fingerprint::of(request, &options.stage(entry));
        self.cache
            .get_or_generate(&fingerprint, || {
                self.generate(request, metadata, entry, &options)
            })
            .await
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        metadata: &CourseMetadata,
        entry: &OutlineEntry,
        options: &BuildOptions,
    ) -> Result<Module, GenerationError> {
        let params = ModuleParams {
            course_topic: request.topic.trim().to_string(),
            course_title: metadata.title.clone(),
            level: request.level,
            tags: request.tags.iter().cloned().collect(),
            style: request.style,
            module_index: entry.index,
            module_count: metadata.module_count(),
            module_title: entry.title.clone(),
            previous_title: entry.previous.clone(),
            next_title: entry.next.clone(),
            exclude_concepts: options.exclude_concept.iter().cloned().collect(),
        };
        let draft = self.client.generate_module(params, options.criticality).await?;

        let chunks = self.chunker.split(&draft.content);
        let videos = self
            .resources
            .videos_for(&VideoQuery {
                keywords: vec![request.topic.trim().to_string(), entry.title.clone()],
                level: request.level,
                max_results: self.max_videos,
            })
            .await;
        debug!(
            index = entry.index,
            chunks = chunks.len(),
            videos = videos.len(),
            "Module generated"
        );

        Ok(Module {
            title: entry.title.clone(),
            description: draft.description,
            objective: draft.objective,
            concepts: draft.concepts,
            chunks,
            summary: draft.summary,
            quiz: draft.quiz,
            resources: ModuleResources {
                videos,
                links: draft.links,
                audio: Vec::new(),
            },
            revision: options.revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryKeyValueStore;
    use crate::config::PipelineConfig;
    use crate::course::{ExperienceLevel, VideoReference};
    use crate::llm_client::StaticContentService;
    use crate::prompts::PromptSet;
    use crate::resources::VideoSearch;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::time::Duration;

    struct BrokenSearch;

    #[async_trait]
    impl VideoSearch for BrokenSearch {
        async fn search(&self, _query: &VideoQuery) -> anyhow::Result<Vec<VideoReference>> {
            Err(anyhow!("search backend unavailable"))
        }
    }

    fn builder(search: Option<Arc<dyn VideoSearch>>) -> (ModuleBuilder, Arc<GenerationClient>, ContentCache) {
        let config = PipelineConfig::default();
        let client = Arc::new(GenerationClient::new(
            Arc::new(StaticContentService::new(3, 12)),
            PromptSet {
                course_metadata: String::new(),
                module_content: String::new(),
            },
            config.timeouts,
            config.retry,
            config.max_modules,
        ));
        let cache = ContentCache::new(Arc::new(MemoryKeyValueStore::new(1 << 20)));
        let builder = ModuleBuilder::new(
            client.clone(),
            cache.clone(),
            config.chunker(),
            ResourceResolver::new(search, Duration::from_secs(1), 3),
            3,
        );
        (builder, client, cache)
    }

    fn course() -> (GenerationRequest, CourseMetadata) {
        let request = GenerationRequest::new("basic statistics", ExperienceLevel::Beginner)
            .with_tags(["sports"]);
        let metadata = CourseMetadata {
            title: "Statistics Through Sports".into(),
            description: "Averages and spread.".into(),
            level: ExperienceLevel::Beginner,
            estimated_duration_hours: 6,
            module_titles: vec!["Data".into(), "Averages".into(), "Spread".into()],
            topics: vec![],
            prerequisites: vec![],
        };
        (request, metadata)
    }

    #[tokio::test]
    async fn modules_are_chunked_and_survive_video_failures() {
        let (builder, _, _) = builder(Some(Arc::new(BrokenSearch)));
        let (request, metadata) = course();
        let entry = metadata.outline_entry(1).unwrap();

        let module = builder
            .build(&request, &metadata, &entry, BuildOptions::original(Criticality::Background))
            .await
            .unwrap();

        assert_eq!(module.title, "Averages");
        assert!(module.chunks.len() >= 2);
        assert!(module.verify_chunks());
        assert!(module.body().contains("an example from sports"));
        assert!(module.resources.videos.is_empty());
        assert_eq!(module.resources.links.len(), 1);
        assert_eq!(module.revision, 0);
    }

    #[tokio::test]
    async fn repeat_builds_come_from_the_cache() {
        let (builder, client, cache) = builder(None);
        let (request, metadata) = course();
        let entry = metadata.outline_entry(0).unwrap();

        let first = builder
            .build(&request, &metadata, &entry, BuildOptions::original(Criticality::OnDemand))
            .await
            .unwrap();
        while cache.inflight() > 0 {
            tokio::task::yield_now().await;
        }
        let second = builder
            .build(&request, &metadata, &entry, BuildOptions::original(Criticality::Background))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(client.stats().module_calls, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn replacements_do_not_reuse_the_original() {
        let (builder, client, _) = builder(None);
        let (request, metadata) = course();
        let entry = metadata.outline_entry(2).unwrap();

        builder
            .build(&request, &metadata, &entry, BuildOptions::original(Criticality::OnDemand))
            .await
            .unwrap();
        let replaced = builder
            .build(
                &request,
                &metadata,
                &entry,
                BuildOptions::replacement(1, Some("Spread fundamentals".into())),
            )
            .await
            .unwrap();

        assert_eq!(client.stats().module_calls, 2);
        assert_eq!(replaced.revision, 1);
        assert_eq!(replaced.concepts, ["Spread in practice"]);
    }
}
