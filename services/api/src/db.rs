//! Data Access Layer
//!
//! Postgres-backed [`CourseStore`]. Each course is a single JSONB document
//! keyed by id; `topic` and `status` are copied into columns for inspection.

use anyhow::Result;
use async_trait::async_trait;
use coursegen_core::course::{Course, CourseId};
use coursegen_core::store::CourseStore;
use sqlx::PgPool;
use sqlx::types::Json;

/// A wrapper around the `PgPool` to provide a clear data access interface.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending `sqlx` migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CourseStore for Db {
    /// Inserts the snapshot, or replaces the stored one.
    async fn save(&self, course: &Course) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO courses (id, topic, status, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                document = EXCLUDED.document,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(course.id)
        .bind(&course.request.topic)
        .bind(course.status.as_str())
        .bind(Json(course))
        .bind(course.created_at)
        .bind(course.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, id: CourseId) -> Result<Option<Course>> {
        let document = sqlx::query_scalar::<_, Json<Course>>(
            "SELECT document FROM courses WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(document.map(|Json(course)| course))
    }

    async fn delete(&self, id: CourseId) -> Result<()> {
        sqlx::query("DELETE FROM courses WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
