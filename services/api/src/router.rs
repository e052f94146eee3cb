//! Axum Router Configuration
//!
//! REST routes, the progress WebSocket and the OpenAPI documentation.

use crate::{
    handlers,
    models::{
        AudioResponse, CourseResponse, CreateCoursePayload, ErrorResponse, GeneratingResponse,
        HealthResponse, ModuleResponse, NarratePayload, ReplaceModulePayload, SlotSummary,
        StartResponse,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::create_course,
        handlers::get_course,
        handlers::delete_course,
        handlers::start_course,
        handlers::resume_course,
        handlers::get_module,
        handlers::replace_module,
        handlers::narrate_chunk,
        handlers::get_audio,
        handlers::stats,
        handlers::health,
    ),
    components(
        schemas(
            CreateCoursePayload, CourseResponse, SlotSummary, ModuleResponse, GeneratingResponse,
            ReplaceModulePayload, NarratePayload, AudioResponse, StartResponse, ErrorResponse,
            HealthResponse
        )
    ),
    tags(
        (name = "Course Generation API", description = "Personalized course generation with background module builds")
    )
)]
pub struct ApiDoc;

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/courses", post(handlers::create_course))
        .route(
            "/courses/{id}",
            get(handlers::get_course).delete(handlers::delete_course),
        )
        .route("/courses/{id}/start", post(handlers::start_course))
        .route("/courses/{id}/resume", post(handlers::resume_course))
        .route("/courses/{id}/modules/{index}", get(handlers::get_module))
        .route(
            "/courses/{id}/modules/{index}/replace",
            post(handlers::replace_module),
        )
        .route(
            "/courses/{id}/modules/{index}/chunks/{order}/audio",
            post(handlers::narrate_chunk),
        )
        .route("/courses/{id}/events", get(ws_handler))
        .route("/audio/{reference}", get(handlers::get_audio))
        .route("/stats", get(handlers::stats))
        .route("/health", get(handlers::health))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Provider};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use coursegen_core::llm_client::StaticContentService;
    use coursegen_core::prompts::PromptSet;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use coursegen_core::course::{Course, CourseId};
    use coursegen_core::store::CourseStore;
    use coursegen_core::{Collaborators, CourseOrchestrator, PipelineConfig};
    use std::path::PathBuf;
    use tower::ServiceExt;

    struct UnreachableStore;

    #[async_trait]
    impl CourseStore for UnreachableStore {
        async fn save(&self, _course: &Course) -> anyhow::Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn load(&self, _id: CourseId) -> anyhow::Result<Option<Course>> {
            Err(anyhow!("connection refused"))
        }
        async fn delete(&self, _id: CourseId) -> anyhow::Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn health(&self) -> anyhow::Result<()> {
            Err(anyhow!("connection refused"))
        }
    }

    fn app(eager_background: bool) -> Router {
        app_with(eager_background, |_| {})
    }

    fn app_with(eager_background: bool, customize: impl FnOnce(&mut Collaborators)) -> Router {
        let pipeline = PipelineConfig {
            eager_background,
            ..PipelineConfig::default()
        };
        let prompts = PromptSet {
            course_metadata: "plan a course".into(),
            module_content: "write a module".into(),
        };
        let mut collaborators =
            Collaborators::in_memory(Arc::new(StaticContentService::default()), prompts, &pipeline);
        customize(&mut collaborators);
        let config = Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            database_url: None,
            provider: Provider::Static,
            openai_api_key: None,
            gemini_api_key: None,
            chat_model: "static".into(),
            log_level: tracing::Level::INFO,
            prompts_path: PathBuf::from("./prompts"),
            youtube_api_key: None,
            speech: None,
            audio_dir: PathBuf::from("./audio"),
            pipeline: pipeline.clone(),
        };
        create_router(Arc::new(AppState {
            orchestrator: CourseOrchestrator::new(pipeline, collaborators),
            config: Arc::new(config),
        }))
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn create(app: &Router) -> serde_json::Value {
        let response = app
            .clone()
            .oneshot(post_json(
                "/courses",
                serde_json::json!({"topic": "basic statistics", "level": "beginner", "tags": ["sports"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        body_json(response).await
    }

    #[tokio::test]
    async fn test_create_and_fetch_course() {
        let app = app(false);
        let created = create(&app).await;

        assert_eq!(created["first_module"]["title"], "Introduction to basic statistics");
        assert_eq!(created["slots"].as_array().unwrap().len(), 4);
        assert_eq!(created["slots"][1]["state"], "empty");

        let id = created["course_id"].as_str().unwrap();
        let response = app.clone().oneshot(get(&format!("/courses/{id}"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["course_id"], created["course_id"]);
    }

    #[tokio::test]
    async fn test_invalid_course_request() {
        let response = app(false)
            .oneshot(post_json(
                "/courses",
                serde_json::json!({"topic": "   ", "level": "beginner"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["message"]
            .as_str()
            .unwrap()
            .contains("topic"));
    }

    #[tokio::test]
    async fn test_modules_are_generated_on_demand() {
        let app = app(false);
        let created = create(&app).await;
        let id = created["course_id"].as_str().unwrap();

        let response = app
            .clone()
            .oneshot(get(&format!("/courses/{id}/modules/2")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["index"], 2);
        assert_eq!(body["module"]["title"], "Practical Applications");

        let response = app
            .clone()
            .oneshot(get(&format!("/courses/{id}/modules/9")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_replace_requires_a_ready_module() {
        let app = app(false);
        let created = create(&app).await;
        let id = created["course_id"].as_str().unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/courses/{id}/modules/3/replace"),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/courses/{id}/modules/0/replace"),
                serde_json::json!({"concept": "Introduction to basic statistics fundamentals"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["module"]["revision"], 1);
    }

    #[tokio::test]
    async fn test_narration_unavailable_without_speech() {
        let app = app(false);
        let created = create(&app).await;
        let id = created["course_id"].as_str().unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/courses/{id}/modules/0/chunks/0/audio"),
                serde_json::json!({"language": "en"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_delete_course() {
        let app = app(false);
        let created = create(&app).await;
        let id = created["course_id"].as_str().unwrap();

        let delete = Request::builder()
            .method("DELETE")
            .uri(format!("/courses/{id}"))
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.clone().oneshot(get(&format!("/courses/{id}"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stats() {
        let app = app(false);
        create(&app).await;

        let response = app.clone().oneshot(get("/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["courses"]["total"], 1);
        assert_eq!(body["generation"]["metadata_calls"], 1);
    }

    #[tokio::test]
    async fn test_health() {
        let response = app(false).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["database"], "connected");
        assert_eq!(body["cache"], "connected");
    }

    #[tokio::test]
    async fn test_health_without_course_store() {
        let app = app_with(false, |collaborators| {
            collaborators.courses = Arc::new(UnreachableStore);
        });
        let response = app.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["database"], "disconnected");
    }

    #[test]
    fn test_openapi_lists_course_routes() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/courses"));
        assert!(doc.paths.paths.contains_key("/courses/{id}/modules/{index}"));
        assert!(doc.paths.paths.contains_key("/audio/{reference}"));
        assert!(doc.paths.paths.contains_key("/health"));
    }
}
