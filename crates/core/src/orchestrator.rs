//! Course Orchestrator
//!
//! Owns every course's lifecycle:
//!
//! 1. `create` fetches metadata through the cache and builds module 0
//!    inside the fast-path budget, then returns.
//! 2. The remaining modules are built in the background on a shared,
//!    bounded worker pool.
//! 3. A caller asking for a module nobody has built yet gets it built on
//!    the spot.
//!
//! Each module index is a slot with its own watch channel, so a single
//! module update never locks the whole course. Slot transitions that carry
//! a result go through a per-course commit section that persists the
//! snapshot and publishes the matching progress event, which keeps stored
//! state and events in completion order.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, timeout};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::builder::{BuildOptions, ModuleBuilder};
use crate::cache::{CacheStats, ContentCache, KeyValueStore, MemoryKeyValueStore};
use crate::config::PipelineConfig;
use crate::course::{
    AudioResource, Course, CourseId, CourseMetadata, CoursePhase, CourseStatus, GenerationRequest,
    Module, ModuleSlot, OutlineEntry, progress_percent,
};
use crate::error::{CourseError, FailureCause, GenerationError};
use crate::fingerprint::{Fingerprint, Stage};
use crate::generation::{Criticality, GenerationClient, GenerationStats};
use crate::llm_client::ContentService;
use crate::progress::{ProgressEvent, ProgressPublisher, ProgressStream};
use crate::prompts::PromptSet;
use crate::resources::{
    MemoryObjectStore, Narrator, ObjectStore, ResourceResolver, SpeechSynthesizer, VideoSearch,
};
use crate::store::{CourseStore, MemoryCourseStore};

/// External services the orchestrator drives.
pub struct Collaborators {
    pub content: Arc<dyn ContentService>,
    pub prompts: PromptSet,
    pub kv: Arc<dyn KeyValueStore>,
    pub courses: Arc<dyn CourseStore>,
    pub videos: Option<Arc<dyn VideoSearch>>,
    pub speech: Option<Arc<dyn SpeechSynthesizer>>,
    pub objects: Arc<dyn ObjectStore>,
}

impl Collaborators {
    /// In-process stores and no video or speech services.
    pub fn in_memory(
        content: Arc<dyn ContentService>,
        prompts: PromptSet,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            content,
            prompts,
            kv: Arc::new(MemoryKeyValueStore::new(config.cache_memory_bytes)),
            courses: Arc::new(MemoryCourseStore::new()),
            videos: None,
            speech: None,
            objects: Arc::new(MemoryObjectStore::new()),
        }
    }
}

/// Result of asking for a module.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleFetch {
    Ready(Arc<Module>),
    /// Someone else is building it; ask again later.
    Pending,
}

/// What a learner wants replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ReplacementScope {
    /// The whole module, freshly generated.
    Module { index: usize },
    /// The module rewritten without a concept the learner already knows.
    Topic { index: usize, concept: String },
}

impl ReplacementScope {
    fn index(&self) -> usize {
        match self {
            ReplacementScope::Module { index } | ReplacementScope::Topic { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseCounts {
    pub total: usize,
    pub generating: usize,
    pub partially_ready: usize,
    pub ready: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// The cache is unreachable; courses still work, uncached.
    Degraded,
    /// The course store is unreachable.
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub store: bool,
    pub cache: bool,
}

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub courses: CourseCounts,
    pub cache: CacheStats,
    pub generation: GenerationStats,
    /// Background builds holding a worker right now.
    pub active_background_builds: usize,
}

struct SlotCell {
    state: watch::Sender<ModuleSlot>,
    /// Held for the duration of a replacement.
    replacing: tokio::sync::Mutex<()>,
}

impl SlotCell {
    fn new(slot: ModuleSlot) -> Self {
        Self {
            state: watch::channel(slot).0,
            replacing: tokio::sync::Mutex::new(()),
        }
    }

    fn current(&self) -> ModuleSlot {
        self.state.borrow().clone()
    }

    /// Moves the slot to `pending` if nobody has built it yet (or, with
    /// `retry_failed`, if its last build failed). Returns whether it did.
    fn claim(&self, retry_failed: bool) -> bool {
        self.state.send_if_modified(|slot| match slot {
            ModuleSlot::Empty => {
                *slot = ModuleSlot::Pending;
                true
            }
            ModuleSlot::Failed { .. } if retry_failed => {
                *slot = ModuleSlot::Pending;
                true
            }
            _ => false,
        })
    }
}

struct Lifecycle {
    phase: CoursePhase,
    updated_at: DateTime<Utc>,
}

struct CourseEntry {
    id: CourseId,
    request: GenerationRequest,
    metadata: CourseMetadata,
    created_at: DateTime<Utc>,
    slots: Vec<SlotCell>,
    lifecycle: Mutex<Lifecycle>,
    commit: tokio::sync::Mutex<()>,
    deleted: AtomicBool,
    background_started: AtomicBool,
    completion_announced: AtomicBool,
}

impl CourseEntry {
    fn new(id: CourseId, request: GenerationRequest, metadata: CourseMetadata) -> Self {
        let now = Utc::now();
        let slots = (0..metadata.module_count())
            .map(|_| SlotCell::new(ModuleSlot::Empty))
            .collect();
        Self {
            id,
            request,
            metadata,
            created_at: now,
            slots,
            lifecycle: Mutex::new(Lifecycle {
                phase: CoursePhase::MetadataReady,
                updated_at: now,
            }),
            commit: tokio::sync::Mutex::new(()),
            deleted: AtomicBool::new(false),
            background_started: AtomicBool::new(false),
            completion_announced: AtomicBool::new(false),
        }
    }

    /// Rebuilds the working copy from a stored snapshot. Slots that were
    /// pending belonged to builds of another process and start over.
    fn restore(course: Course) -> Self {
        let slots = course
            .slots
            .into_iter()
            .map(|slot| match slot {
                ModuleSlot::Pending => SlotCell::new(ModuleSlot::Empty),
                other => SlotCell::new(other),
            })
            .collect();
        Self {
            id: course.id,
            request: course.request,
            metadata: course.metadata,
            created_at: course.created_at,
            slots,
            lifecycle: Mutex::new(Lifecycle {
                phase: course.phase,
                updated_at: course.updated_at,
            }),
            commit: tokio::sync::Mutex::new(()),
            deleted: AtomicBool::new(false),
            background_started: AtomicBool::new(false),
            completion_announced: AtomicBool::new(course.status.is_terminal()),
        }
    }

    fn slot(&self, index: usize) -> Result<(&SlotCell, OutlineEntry), CourseError> {
        match (self.slots.get(index), self.metadata.outline_entry(index)) {
            (Some(cell), Some(entry)) => Ok((cell, entry)),
            _ => Err(CourseError::ModuleOutOfRange {
                index,
                count: self.slots.len(),
            }),
        }
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Every slot holds a module or a failure.
    fn is_finished(&self) -> bool {
        self.slots.iter().all(|cell| cell.state.borrow().is_settled())
    }

    fn advance(&self, to: CoursePhase) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.phase < to && !is_final(lifecycle.phase) {
            lifecycle.phase = to;
            lifecycle.updated_at = Utc::now();
        }
    }

    /// Folds the slot-derived status into the lifecycle phase.
    fn record_status(&self, status: CourseStatus) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.updated_at = Utc::now();
        lifecycle.phase = match (status, lifecycle.phase) {
            (CourseStatus::Ready, _) => CoursePhase::Ready,
            (CourseStatus::Failed, _) => CoursePhase::Failed,
            (CourseStatus::PartiallyReady, CoursePhase::GeneratingBackground) => {
                CoursePhase::PartiallyReady
            }
            (_, phase) => phase,
        };
    }

    fn snapshot(&self) -> Course {
        let slots: Vec<ModuleSlot> = self.slots.iter().map(SlotCell::current).collect();
        let lifecycle = self.lifecycle.lock();
        Course {
            id: self.id,
            request: self.request.clone(),
            metadata: self.metadata.clone(),
            status: CourseStatus::from_slots(&slots),
            phase: lifecycle.phase,
            created_at: self.created_at,
            updated_at: lifecycle.updated_at,
            slots,
        }
    }
}

fn is_final(phase: CoursePhase) -> bool {
    matches!(phase, CoursePhase::Ready | CoursePhase::Failed)
}

#[derive(Default)]
struct Registry {
    entries: HashMap<CourseId, Arc<CourseEntry>>,
    /// Courses whose deletion is under way.
    deleting: HashSet<CourseId>,
    /// Bumped each time a deletion starts.
    deletions: u64,
}

/// Clears a course's deletion mark when its delete ends, even if the
/// caller stops waiting.
struct DeletionMark<'a> {
    registry: &'a RwLock<Registry>,
    course_id: CourseId,
}

impl Drop for DeletionMark<'_> {
    fn drop(&mut self) {
        self.registry.write().deleting.remove(&self.course_id);
    }
}

struct Inner {
    config: PipelineConfig,
    client: Arc<GenerationClient>,
    cache: ContentCache,
    builder: ModuleBuilder,
    narrator: Narrator,
    store: Arc<dyn CourseStore>,
    progress: ProgressPublisher,
    workers: Arc<Semaphore>,
    courses: RwLock<Registry>,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct CourseOrchestrator {
    inner: Arc<Inner>,
}

impl CourseOrchestrator {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        let client = Arc::new(GenerationClient::new(
            collaborators.content,
            collaborators.prompts,
            config.timeouts,
            config.retry,
            config.max_modules,
        ));
        let cache = ContentCache::new(collaborators.kv);
        let builder = ModuleBuilder::new(
            client.clone(),
            cache.clone(),
            config.chunker(),
            ResourceResolver::new(collaborators.videos, config.resource_timeout, config.max_videos),
            config.max_videos,
        );
        Self {
            inner: Arc::new(Inner {
                client,
                cache,
                builder,
                narrator: Narrator::new(collaborators.speech, collaborators.objects),
                store: collaborators.courses,
                progress: ProgressPublisher::new(config.progress_capacity),
                workers: Arc::new(Semaphore::new(config.background_concurrency.max(1))),
                courses: RwLock::new(Registry::default()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Creates a course and returns it with module 0, within the fast-path
    /// budget.
    ///
    /// Metadata failure is returned as an error and no course is kept. A
    /// module-0 failure is not: the course comes back with slot 0 failed.
    /// If module 0 is still building when the budget runs out, the course
    /// comes back with slot 0 pending and the build carries on.
    #[instrument(skip_all, fields(topic = %request.topic, level = %request.level))]
    pub async fn create(&self, request: GenerationRequest) -> Result<Course, CourseError> {
        request.validate()?;
        let started = Instant::now();
        let budget = self.inner.config.fast_path_budget;

        let fingerprint = Fingerprint::of(&request, &Stage::Metadata);
        let client = &self.inner.client;
        let generated = timeout(
            budget,
            self.inner.cache.get_or_generate(&fingerprint, || {
                client.generate_metadata(&request, Criticality::FastPath)
            }),
        )
        .await;
        let metadata = match generated {
            Ok(Ok(metadata)) => metadata,
            Ok(Err(err)) => {
                error!(cause = %err.cause, error = %err, "Course metadata generation failed");
                return Err(err.into());
            }
            Err(_) => {
                error!(budget_ms = budget.as_millis() as u64, "Course metadata exceeded the fast-path budget");
                return Err(GenerationError::new(
                    FailureCause::Timeout,
                    0,
                    "course metadata was not ready within the fast-path budget",
                )
                .into());
            }
        };

        let entry = Arc::new(CourseEntry::new(Uuid::new_v4(), request, metadata));
        self.inner.courses.write().entries.insert(entry.id, entry.clone());
        self.evict_finished();
        if let Err(err) = self.inner.store.save(&entry.snapshot()).await {
            warn!(course_id = %entry.id, error = %err, "Could not persist new course");
        }
        info!(
            course_id = %entry.id,
            title = %entry.metadata.title,
            modules = entry.slots.len(),
            "Course metadata ready"
        );

        let (cell, outline) = entry.slot(0)?;
        if cell.claim(false) {
            let build = self.spawn_build(entry.clone(), outline, Criticality::FastPath);
            let remaining = budget.saturating_sub(started.elapsed());
            match timeout(remaining, build).await {
                Ok(Ok(Ok(_))) => debug!(course_id = %entry.id, "First module ready"),
                Ok(Ok(Err(err))) => {
                    warn!(course_id = %entry.id, error = %err, "First module failed, returning course without it")
                }
                Ok(Err(err)) => error!(course_id = %entry.id, error = %err, "First module task failed"),
                Err(_) => {
                    warn!(course_id = %entry.id, "First module still building after the fast-path budget")
                }
            }
        }

        if self.inner.config.eager_background {
            self.schedule_background(&entry);
        }
        Ok(entry.snapshot())
    }

    /// Current snapshot, restored from the durable store if this process
    /// does not hold the course.
    pub async fn get_course(&self, course_id: CourseId) -> Result<Course, CourseError> {
        Ok(self.entry(course_id).await?.snapshot())
    }

    /// Returns the module at `index`, building it on the spot if nobody has.
    ///
    /// A slot whose last build failed is rebuilt; if the rebuild fails too
    /// its error is returned. A slot someone else is building yields
    /// [`ModuleFetch::Pending`].
    #[instrument(skip(self), fields(course_id = %course_id))]
    pub async fn get_module(
        &self,
        course_id: CourseId,
        index: usize,
    ) -> Result<ModuleFetch, CourseError> {
        let entry = self.entry(course_id).await?;
        let (cell, outline) = entry.slot(index)?;
        match cell.current() {
            ModuleSlot::Ready { module } => Ok(ModuleFetch::Ready(module)),
            ModuleSlot::Pending => Ok(ModuleFetch::Pending),
            ModuleSlot::Empty | ModuleSlot::Failed { .. } => {
                if !cell.claim(true) {
                    return fetch(index, cell.current());
                }
                info!(index, "Building module on demand");
                let build = self.spawn_build(entry.clone(), outline, Criticality::OnDemand);
                match build.await {
                    Ok(Ok(module)) => Ok(ModuleFetch::Ready(module)),
                    Ok(Err(err)) => Err(err.into()),
                    Err(err) => Err(GenerationError::new(
                        FailureCause::UpstreamError,
                        0,
                        format!("module build task ended unexpectedly: {err}"),
                    )
                    .into()),
                }
            }
        }
    }

    /// Like [`get_module`](Self::get_module), but waits up to `max_wait`
    /// for a pending slot to settle.
    pub async fn wait_for_module(
        &self,
        course_id: CourseId,
        index: usize,
        max_wait: Duration,
    ) -> Result<ModuleFetch, CourseError> {
        if let ModuleFetch::Ready(module) = self.get_module(course_id, index).await? {
            return Ok(ModuleFetch::Ready(module));
        }
        let entry = self.entry(course_id).await?;
        let (cell, _) = entry.slot(index)?;
        let mut rx = cell.state.subscribe();
        let settled = timeout(max_wait, async {
            rx.wait_for(ModuleSlot::is_settled).await.map(|slot| slot.clone())
        })
        .await;
        match settled {
            Ok(Ok(slot)) => fetch(index, slot),
            Ok(Err(_)) => Err(CourseError::CourseNotFound(course_id)),
            Err(_) => Ok(ModuleFetch::Pending),
        }
    }

    /// Schedules background builds for every slot nobody has built yet.
    /// Returns how many were scheduled; 0 if fan-out already ran.
    pub async fn start_background(&self, course_id: CourseId) -> Result<usize, CourseError> {
        let entry = self.entry(course_id).await?;
        Ok(self.schedule_background(&entry))
    }

    /// Regenerates a ready module and overwrites its slot.
    ///
    /// The old module stays in place if the new build fails.
    #[instrument(skip(self), fields(course_id = %course_id))]
    pub async fn request_replacement(
        &self,
        course_id: CourseId,
        scope: ReplacementScope,
    ) -> Result<Arc<Module>, CourseError> {
        let index = scope.index();
        let exclude_concept = match &scope {
            ReplacementScope::Module { .. } => None,
            ReplacementScope::Topic { concept, .. } => {
                let concept = concept.trim();
                if concept.is_empty() {
                    return Err(CourseError::Validation("concept must not be empty".into()));
                }
                Some(concept.to_string())
            }
        };

        let entry = self.entry(course_id).await?;
        let (cell, outline) = entry.slot(index)?;
        let Ok(_replacing) = cell.replacing.try_lock() else {
            return Err(CourseError::SlotBusy { index });
        };
        let current = match cell.current() {
            ModuleSlot::Ready { module } => module,
            ModuleSlot::Pending => return Err(CourseError::SlotBusy { index }),
            ModuleSlot::Empty | ModuleSlot::Failed { .. } => {
                return Err(CourseError::ModuleNotReady { index });
            }
        };

        // Only a replacement that lands moves the slot to a new revision.
        let revision = current.revision + 1;
        let module = self
            .inner
            .builder
            .build(
                &entry.request,
                &entry.metadata,
                &outline,
                BuildOptions::replacement(revision, exclude_concept),
            )
            .await?;
        let module = Arc::new(module);
        self.settle(
            &entry,
            index,
            ModuleSlot::Ready {
                module: module.clone(),
            },
        )
        .await;
        info!(index, revision, "Module replaced");
        Ok(module)
    }

    /// Progress events for the course from now on.
    pub async fn subscribe(&self, course_id: CourseId) -> Result<ProgressStream, CourseError> {
        let entry = self.entry(course_id).await?;
        Ok(self.inner.progress.subscribe(entry.id))
    }

    /// Deletes the course. Builds already running finish, but their results
    /// are dropped.
    #[instrument(skip(self), fields(course_id = %course_id))]
    pub async fn delete(&self, course_id: CourseId) -> Result<(), CourseError> {
        let removed = {
            let mut registry = self.inner.courses.write();
            if !registry.deleting.insert(course_id) {
                return Err(CourseError::CourseNotFound(course_id));
            }
            registry.deletions += 1;
            registry.entries.remove(&course_id)
        };
        let _mark = DeletionMark {
            registry: &self.inner.courses,
            course_id,
        };
        self.purge(course_id, removed).await
    }

    async fn purge(
        &self,
        course_id: CourseId,
        removed: Option<Arc<CourseEntry>>,
    ) -> Result<(), CourseError> {
        match removed {
            Some(entry) => {
                let _commit = entry.commit.lock().await;
                entry.deleted.store(true, Ordering::SeqCst);
            }
            None => {
                if self.inner.store.load(course_id).await?.is_none() {
                    return Err(CourseError::CourseNotFound(course_id));
                }
            }
        }
        self.inner.progress.close(course_id);
        self.inner.store.delete(course_id).await?;
        info!("Course deleted");
        Ok(())
    }

    /// Reloads a course from the durable store and schedules background
    /// builds for every slot without a module.
    #[instrument(skip(self), fields(course_id = %course_id))]
    pub async fn resume(&self, course_id: CourseId) -> Result<Course, CourseError> {
        let entry = self.entry(course_id).await?;
        let scheduled = self.schedule_background(&entry);
        info!(scheduled, "Course resumed");
        Ok(entry.snapshot())
    }

    /// Narrates one chunk of a ready module.
    ///
    /// `None` when speech synthesis is not configured or fails; narration
    /// is never required for a module to be usable.
    #[instrument(skip(self), fields(course_id = %course_id))]
    pub async fn narrate_chunk(
        &self,
        course_id: CourseId,
        index: usize,
        order: usize,
        language: &str,
    ) -> Result<Option<AudioResource>, CourseError> {
        let entry = self.entry(course_id).await?;
        let (cell, _) = entry.slot(index)?;
        let module = cell
            .current()
            .module()
            .cloned()
            .ok_or(CourseError::ModuleNotReady { index })?;
        let chunk = module
            .chunks
            .get(order)
            .ok_or(CourseError::ChunkNotFound { index, order })?;
        if !self.inner.narrator.is_available() {
            return Ok(None);
        }

        let fingerprint = Fingerprint::narration(&chunk.checksum, language);
        let narrator = &self.inner.narrator;
        let narrated = self
            .inner
            .cache
            .get_or_generate(&fingerprint, || async {
                narrator
                    .narrate(&chunk.content, language)
                    .await
                    .map_err(|err| GenerationError::new(FailureCause::UpstreamError, 1, err.to_string()))
            })
            .await;
        match narrated {
            Ok(audio) => {
                self.attach_audio(&entry, index, module.revision, &audio).await;
                Ok(Some(audio))
            }
            Err(err) => {
                warn!(index, order, error = %err, "Narration failed");
                Ok(None)
            }
        }
    }

    /// Stored audio for a reference returned by [`narrate_chunk`](Self::narrate_chunk).
    pub async fn audio(&self, reference: &str) -> Result<Vec<u8>, CourseError> {
        Ok(self.inner.narrator.audio(reference).await?)
    }

    /// Pings the course store and the cache backend.
    pub async fn health(&self) -> HealthReport {
        let (store, cache) = tokio::join!(
            probe("course store", self.inner.store.health()),
            probe("cache", self.inner.cache.health()),
        );
        let status = match (store, cache) {
            (false, _) => HealthStatus::Unhealthy,
            (true, false) => HealthStatus::Degraded,
            (true, true) => HealthStatus::Healthy,
        };
        HealthReport {
            status,
            store,
            cache,
        }
    }

    /// Counters for the courses held in memory, the cache and the content
    /// service.
    pub fn stats(&self) -> PipelineStats {
        let mut courses = CourseCounts::default();
        for entry in self.inner.courses.read().entries.values() {
            let slots: Vec<ModuleSlot> = entry.slots.iter().map(SlotCell::current).collect();
            courses.total += 1;
            match CourseStatus::from_slots(&slots) {
                CourseStatus::Generating => courses.generating += 1,
                CourseStatus::PartiallyReady => courses.partially_ready += 1,
                CourseStatus::Ready => courses.ready += 1,
                CourseStatus::Failed => courses.failed += 1,
            }
        }
        let ceiling = self.inner.config.background_concurrency.max(1);
        PipelineStats {
            courses,
            cache: self.inner.cache.stats(),
            generation: self.inner.client.stats(),
            active_background_builds: ceiling.saturating_sub(self.inner.workers.available_permits()),
        }
    }

    async fn entry(&self, course_id: CourseId) -> Result<Arc<CourseEntry>, CourseError> {
        loop {
            let deletions = {
                let registry = self.inner.courses.read();
                if let Some(entry) = registry.entries.get(&course_id) {
                    return Ok(entry.clone());
                }
                if registry.deleting.contains(&course_id) {
                    return Err(CourseError::CourseNotFound(course_id));
                }
                registry.deletions
            };
            let course = self
                .inner
                .store
                .load(course_id)
                .await?
                .ok_or(CourseError::CourseNotFound(course_id))?;

            let restored = {
                let mut registry = self.inner.courses.write();
                if registry.deleting.contains(&course_id) {
                    return Err(CourseError::CourseNotFound(course_id));
                }
                // A deletion started while loading; what was read may be gone.
                if registry.deletions != deletions {
                    None
                } else {
                    Some(
                        registry
                            .entries
                            .entry(course_id)
                            .or_insert_with(|| Arc::new(CourseEntry::restore(course)))
                            .clone(),
                    )
                }
            };
            if let Some(entry) = restored {
                debug!(course_id = %course_id, "Restored course from store");
                self.evict_finished();
                return Ok(entry);
            }
        }
    }

    /// Drops idle finished courses once more than `max_resident_courses`
    /// are held, oldest first. A course is idle when only the registry
    /// holds it.
    fn evict_finished(&self) {
        let limit = self.inner.config.max_resident_courses;
        let mut registry = self.inner.courses.write();
        let Some(excess) = registry.entries.len().checked_sub(limit).filter(|n| *n > 0) else {
            return;
        };
        let mut idle: Vec<(DateTime<Utc>, CourseId)> = registry
            .entries
            .values()
            .filter(|entry| Arc::strong_count(entry) == 1 && entry.is_finished())
            .map(|entry| (entry.lifecycle.lock().updated_at, entry.id))
            .collect();
        idle.sort_unstable();
        for (_, course_id) in idle.into_iter().take(excess) {
            registry.entries.remove(&course_id);
            debug!(course_id = %course_id, "Evicted finished course");
        }
    }

    fn schedule_background(&self, entry: &Arc<CourseEntry>) -> usize {
        if entry.background_started.swap(true, Ordering::SeqCst) {
            return 0;
        }
        let indices: Vec<usize> = entry
            .slots
            .iter()
            .enumerate()
            .filter(|(_, cell)| matches!(cell.current(), ModuleSlot::Empty))
            .map(|(index, _)| index)
            .collect();
        if indices.is_empty() {
            return 0;
        }
        entry.advance(CoursePhase::GeneratingBackground);

        let count = indices.len();
        let span = info_span!("background", course_id = %entry.id);
        tokio::spawn(self.clone().run_background(entry.clone(), indices).instrument(span));
        count
    }

    async fn run_background(self, entry: Arc<CourseEntry>, indices: Vec<usize>) {
        info!(modules = indices.len(), "Background generation started");
        let mut tasks = JoinSet::new();
        for index in indices {
            let this = self.clone();
            let entry = entry.clone();
            tasks.spawn(async move {
                let Ok(_permit) = this.inner.workers.clone().acquire_owned().await else {
                    return;
                };
                if entry.is_deleted() {
                    return;
                }
                let Ok((cell, outline)) = entry.slot(index) else {
                    return;
                };
                // Already built, or being built on demand.
                if !cell.claim(false) {
                    return;
                }
                // Result is recorded in the slot.
                let _ = this.build_and_settle(&entry, outline, Criticality::Background).await;
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Background module task failed");
            }
        }
        info!("Background generation finished");
    }

    /// Builds a claimed slot in its own task, so the slot settles even if
    /// the caller stops waiting.
    fn spawn_build(
        &self,
        entry: Arc<CourseEntry>,
        outline: OutlineEntry,
        criticality: Criticality,
    ) -> JoinHandle<Result<Arc<Module>, GenerationError>> {
        let this = self.clone();
        tokio::spawn(async move { this.build_and_settle(&entry, outline, criticality).await })
    }

    async fn build_and_settle(
        &self,
        entry: &Arc<CourseEntry>,
        outline: OutlineEntry,
        criticality: Criticality,
    ) -> Result<Arc<Module>, GenerationError> {
        let index = outline.index;
        let built = self
            .inner
            .builder
            .build(
                &entry.request,
                &entry.metadata,
                &outline,
                BuildOptions::original(criticality),
            )
            .await
            .map(Arc::new);
        let slot = match &built {
            Ok(module) => ModuleSlot::Ready {
                module: module.clone(),
            },
            Err(err) => ModuleSlot::Failed {
                reason: err.to_string(),
            },
        };
        self.settle(entry, index, slot).await;
        built
    }

    /// Records a finished build: writes the slot, persists the snapshot and
    /// publishes the event, all inside the course's commit section.
    async fn settle(&self, entry: &Arc<CourseEntry>, index: usize, slot: ModuleSlot) {
        let _commit = entry.commit.lock().await;
        if entry.is_deleted() {
            debug!(course_id = %entry.id, index, "Discarding result for deleted course");
            return;
        }
        let Some(cell) = entry.slots.get(index) else {
            return;
        };
        cell.state.send_replace(slot.clone());

        let slots: Vec<ModuleSlot> = entry.slots.iter().map(SlotCell::current).collect();
        let status = CourseStatus::from_slots(&slots);
        if index == 0 && slot.is_ready() {
            entry.advance(CoursePhase::FirstModuleReady);
        }
        entry.record_status(status);

        if let Err(err) = self.inner.store.save(&entry.snapshot()).await {
            warn!(course_id = %entry.id, index, error = %err, "Could not persist course");
        }

        let event = match slot {
            ModuleSlot::Ready { module } => {
                info!(course_id = %entry.id, index, title = %module.title, "Module ready");
                ProgressEvent::ModuleReady {
                    index,
                    title: module.title.clone(),
                    progress_percent: progress_percent(&slots),
                }
            }
            ModuleSlot::Failed { reason } => {
                warn!(course_id = %entry.id, index, %reason, "Module failed");
                ProgressEvent::ModuleFailed { index, reason }
            }
            ModuleSlot::Empty | ModuleSlot::Pending => return,
        };
        self.inner.progress.publish(entry.id, event);

        if status.is_terminal() && !entry.completion_announced.swap(true, Ordering::SeqCst) {
            let ready = slots.iter().filter(|s| s.is_ready()).count();
            let failed = slots.len() - ready;
            info!(course_id = %entry.id, ready, failed, status = status.as_str(), "Course complete");
            self.inner
                .progress
                .publish(entry.id, ProgressEvent::CourseComplete { ready, failed });
            self.evict_finished();
        }
    }

    /// Records narration on the module it was made from. Nothing changes if
    /// the slot has moved to another revision or already lists it.
    async fn attach_audio(
        &self,
        entry: &Arc<CourseEntry>,
        index: usize,
        revision: u32,
        audio: &AudioResource,
    ) {
        let _commit = entry.commit.lock().await;
        if entry.is_deleted() {
            return;
        }
        let Some(cell) = entry.slots.get(index) else {
            return;
        };
        let attached = cell.state.send_if_modified(|slot| {
            let ModuleSlot::Ready { module } = slot else {
                return false;
            };
            let known = module
                .resources
                .audio
                .iter()
                .any(|a| a.checksum == audio.checksum && a.language == audio.language);
            if module.revision != revision || known {
                return false;
            }
            Arc::make_mut(module).resources.audio.push(audio.clone());
            true
        });
        if attached {
            if let Err(err) = self.inner.store.save(&entry.snapshot()).await {
                warn!(course_id = %entry.id, index, error = %err, "Could not persist narration");
            }
        }
    }
}

async fn probe(component: &str, check: impl Future<Output = anyhow::Result<()>>) -> bool {
    match timeout(HEALTH_TIMEOUT, check).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(component, error = %err, "Health check failed");
            false
        }
        Err(_) => {
            warn!(component, "Health check timed out");
            false
        }
    }
}

fn fetch(index: usize, slot: ModuleSlot) -> Result<ModuleFetch, CourseError> {
    match slot {
        ModuleSlot::Ready { module } => Ok(ModuleFetch::Ready(module)),
        ModuleSlot::Failed { reason } => Err(CourseError::ModuleFailed { index, reason }),
        ModuleSlot::Empty | ModuleSlot::Pending => Ok(ModuleFetch::Pending),
    }
}
