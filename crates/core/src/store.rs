//! Durable course storage.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::course::{Course, CourseId};

/// Persists course snapshots by id.
///
/// The orchestrator keeps the working copy in memory and writes a snapshot
/// on every slot transition, so a restarted process can resume from here.
#[async_trait]
pub trait CourseStore: Send + Sync {
    async fn save(&self, course: &Course) -> Result<()>;
    async fn load(&self, id: CourseId) -> Result<Option<Course>>;
    async fn delete(&self, id: CourseId) -> Result<()>;

    async fn health(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCourseStore {
    courses: RwLock<HashMap<CourseId, Course>>,
}

impl MemoryCourseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.courses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CourseStore for MemoryCourseStore {
    async fn save(&self, course: &Course) -> Result<()> {
        self.courses.write().insert(course.id, course.clone());
        Ok(())
    }

    async fn load(&self, id: CourseId) -> Result<Option<Course>> {
        Ok(self.courses.read().get(&id).cloned())
    }

    async fn delete(&self, id: CourseId) -> Result<()> {
        self.courses.write().remove(&id);
        Ok(())
    }
}
