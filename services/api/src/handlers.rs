//! Axum Handlers for the REST API
//!
//! Thin wrappers over [`CourseOrchestrator`](coursegen_core::CourseOrchestrator)
//! operations. `utoipa` annotations generate the OpenAPI document.

use axum::{
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use coursegen_core::{CourseError, HealthStatus, ModuleFetch, ReplacementScope};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    models::{
        AudioResponse, CourseResponse, CreateCoursePayload, ErrorResponse, GeneratingResponse,
        HealthResponse, ModuleQuery, ModuleResponse, NarratePayload, ReplaceModulePayload,
        StartResponse,
    },
    state::AppState,
};

/// Longest a client may ask `GET /courses/{id}/modules/{index}` to wait.
const MAX_WAIT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// The content service failed.
    BadGateway(String),
    Unavailable(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Conflict(message) => (StatusCode::CONFLICT, message),
            ApiError::BadGateway(message) => (StatusCode::BAD_GATEWAY, message),
            ApiError::Unavailable(message) => (StatusCode::SERVICE_UNAVAILABLE, message),
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred.".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { message })).into_response()
    }
}

impl From<CourseError> for ApiError {
    fn from(err: CourseError) -> Self {
        match err {
            CourseError::Validation(_) => ApiError::BadRequest(err.to_string()),
            CourseError::CourseNotFound(_)
            | CourseError::ModuleOutOfRange { .. }
            | CourseError::ChunkNotFound { .. } => ApiError::NotFound(err.to_string()),
            CourseError::SlotBusy { .. } | CourseError::ModuleNotReady { .. } => {
                ApiError::Conflict(err.to_string())
            }
            CourseError::Generation(_) | CourseError::ModuleFailed { .. } => {
                warn!(error = %err, "Generation failed");
                ApiError::BadGateway(err.to_string())
            }
            CourseError::Resource(inner) => {
                warn!(error = %inner, "Resource lookup failed");
                ApiError::NotFound("resource not found".to_string())
            }
            CourseError::Storage(inner) => ApiError::InternalServerError(inner),
        }
    }
}

/// Create a course: outline plus first module.
#[utoipa::path(
    post,
    path = "/courses",
    request_body = CreateCoursePayload,
    responses(
        (status = 201, description = "Course created", body = CourseResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 502, description = "Content generation failed", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn create_course(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateCoursePayload>,
) -> Result<impl IntoResponse, ApiError> {
    let course = state.orchestrator.create(payload.into_request()).await?;
    Ok((StatusCode::CREATED, Json(CourseResponse::from(&course))))
}

/// Get a course snapshot.
#[utoipa::path(
    get,
    path = "/courses/{id}",
    responses(
        (status = 200, description = "Course snapshot", body = CourseResponse),
        (status = 404, description = "Course not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Course ID"))
)]
pub async fn get_course(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CourseResponse>, ApiError> {
    let course = state.orchestrator.get_course(id).await?;
    Ok(Json(CourseResponse::from(&course)))
}

/// Delete a course. Modules still being generated are discarded.
#[utoipa::path(
    delete,
    path = "/courses/{id}",
    responses(
        (status = 204, description = "Course deleted"),
        (status = 404, description = "Course not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Course ID"))
)]
pub async fn delete_course(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start generating the remaining modules in the background.
#[utoipa::path(
    post,
    path = "/courses/{id}/start",
    responses(
        (status = 202, description = "Background generation scheduled", body = StartResponse),
        (status = 404, description = "Course not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Course ID"))
)]
pub async fn start_course(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let scheduled = state.orchestrator.start_background(id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            course_id: id,
            scheduled,
        }),
    ))
}

/// Reload a course from storage and finish generating it.
#[utoipa::path(
    post,
    path = "/courses/{id}/resume",
    responses(
        (status = 200, description = "Course resumed", body = CourseResponse),
        (status = 404, description = "Course not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Course ID"))
)]
pub async fn resume_course(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CourseResponse>, ApiError> {
    let course = state.orchestrator.resume(id).await?;
    Ok(Json(CourseResponse::from(&course)))
}

/// Get a module, generating it now if nobody has.
#[utoipa::path(
    get,
    path = "/courses/{id}/modules/{index}",
    responses(
        (status = 200, description = "Module ready", body = ModuleResponse),
        (status = 202, description = "Module is being generated", body = GeneratingResponse),
        (status = 404, description = "Course or module not found", body = ErrorResponse),
        (status = 502, description = "Content generation failed", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Course ID"),
        ("index" = usize, Path, description = "Module index"),
        ModuleQuery
    )
)]
pub async fn get_module(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(Uuid, usize)>,
    Query(query): Query<ModuleQuery>,
) -> Result<Response, ApiError> {
    let fetched = match query.wait_ms {
        Some(ms) if ms > 0 => {
            let wait = Duration::from_millis(ms).min(MAX_WAIT);
            state.orchestrator.wait_for_module(id, index, wait).await?
        }
        _ => state.orchestrator.get_module(id, index).await?,
    };
    Ok(match fetched {
        ModuleFetch::Ready(module) => Json(ModuleResponse { index, module }).into_response(),
        ModuleFetch::Pending => {
            (StatusCode::ACCEPTED, Json(GeneratingResponse::new(index))).into_response()
        }
    })
}

/// Regenerate a ready module, optionally leaving out a known concept.
#[utoipa::path(
    post,
    path = "/courses/{id}/modules/{index}/replace",
    request_body = ReplaceModulePayload,
    responses(
        (status = 200, description = "Replacement module", body = ModuleResponse),
        (status = 409, description = "Module is not ready or already being regenerated", body = ErrorResponse),
        (status = 502, description = "Content generation failed", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Course ID"),
        ("index" = usize, Path, description = "Module index")
    )
)]
pub async fn replace_module(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(Uuid, usize)>,
    payload: Option<Json<ReplaceModulePayload>>,
) -> Result<Json<ModuleResponse>, ApiError> {
    let Json(payload) = payload.unwrap_or_default();
    let scope = match payload.concept {
        Some(concept) => ReplacementScope::Topic { index, concept },
        None => ReplacementScope::Module { index },
    };
    let module = state.orchestrator.request_replacement(id, scope).await?;
    Ok(Json(ModuleResponse { index, module }))
}

/// Narrate one chunk of a ready module.
#[utoipa::path(
    post,
    path = "/courses/{id}/modules/{index}/chunks/{order}/audio",
    request_body = NarratePayload,
    responses(
        (status = 200, description = "Narration stored", body = AudioResponse),
        (status = 404, description = "Course, module or chunk not found", body = ErrorResponse),
        (status = 409, description = "Module is not ready", body = ErrorResponse),
        (status = 503, description = "Speech synthesis unavailable", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Course ID"),
        ("index" = usize, Path, description = "Module index"),
        ("order" = usize, Path, description = "Chunk order within the module")
    )
)]
pub async fn narrate_chunk(
    State(state): State<Arc<AppState>>,
    Path((id, index, order)): Path<(Uuid, usize, usize)>,
    payload: Option<Json<NarratePayload>>,
) -> Result<Json<AudioResponse>, ApiError> {
    let Json(payload) = payload.unwrap_or_default();
    let audio = state
        .orchestrator
        .narrate_chunk(id, index, order, &payload.language)
        .await?
        .ok_or_else(|| ApiError::Unavailable("speech synthesis is unavailable".to_string()))?;
    Ok(Json(AudioResponse::from(audio)))
}

/// Fetch stored narration.
#[utoipa::path(
    get,
    path = "/audio/{reference}",
    responses(
        (status = 200, description = "MP3 audio", content_type = "audio/mpeg"),
        (status = 404, description = "Audio not found", body = ErrorResponse)
    ),
    params(("reference" = String, Path, description = "Audio reference"))
)]
pub async fn get_audio(
    State(state): State<Arc<AppState>>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let bytes = state.orchestrator.audio(&reference).await?;
    Ok(([(header::CONTENT_TYPE, "audio/mpeg")], bytes))
}

/// Pipeline statistics.
#[utoipa::path(
    get,
    path = "/stats",
    responses((status = 200, description = "Course, cache and generation counters", body = Object))
)]
pub async fn stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.stats())
}

/// Health of the course store and the cache.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Healthy, or degraded without the cache", body = HealthResponse),
        (status = 503, description = "Course store unreachable", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.orchestrator.health().await;
    let status = match report.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
    };
    (status, Json(HealthResponse::from(report)))
}
