//! Generation Client
//!
//! A uniform adapter over the [`ContentService`]: it shapes requests from
//! typed parameters, bounds every attempt with a timeout chosen by who is
//! waiting, retries transient failures with exponential backoff and checks
//! each response against the expected schema before handing it on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::config::{RetryPolicy, Timeouts};
use crate::course::{
    CourseMetadata, ExperienceLevel, GenerationRequest, QuizQuestion, StyleParameters, TextLink,
};
use crate::error::{GenerationError, UpstreamError};
use crate::llm_client::ContentService;
use crate::prompts::PromptSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationKind {
    CourseMetadata,
    ModuleContent,
}

impl GenerationKind {
    /// File stem of the prompt template for this kind.
    pub fn template_name(&self) -> &'static str {
        match self {
            GenerationKind::CourseMetadata => "course_metadata",
            GenerationKind::ModuleContent => "module_content",
        }
    }

    fn max_tokens(&self) -> u32 {
        match self {
            GenerationKind::CourseMetadata => 1_500,
            GenerationKind::ModuleContent => 4_000,
        }
    }
}

/// Who is waiting on a generation; selects the per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Criticality {
    FastPath,
    OnDemand,
    Background,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataParams {
    pub topic: String,
    pub level: ExperienceLevel,
    pub tags: Vec<String>,
    pub style: StyleParameters,
    pub max_modules: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleParams {
    pub course_topic: String,
    pub course_title: String,
    pub level: ExperienceLevel,
    pub tags: Vec<String>,
    pub style: StyleParameters,
    pub module_index: usize,
    pub module_count: usize,
    pub module_title: String,
    pub previous_title: Option<String>,
    pub next_title: Option<String>,
    /// Concepts to leave out of a replacement module.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_concepts: Vec<String>,
}

/// Structured parameters sent to the content service. Each field travels
/// as its own JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromptParams {
    CourseMetadata(MetadataParams),
    ModuleContent(ModuleParams),
}

impl PromptParams {
    pub fn kind(&self) -> GenerationKind {
        match self {
            PromptParams::CourseMetadata(_) => GenerationKind::CourseMetadata,
            PromptParams::ModuleContent(_) => GenerationKind::ModuleContent,
        }
    }
}

/// One call to the content service.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentRequest {
    pub kind: GenerationKind,
    pub system_prompt: String,
    pub params: PromptParams,
    pub max_tokens: u32,
}

/// Validated module payload, before chunking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDraft {
    pub description: String,
    pub objective: String,
    pub concepts: Vec<String>,
    pub content: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub quiz: Vec<QuizQuestion>,
    #[serde(default)]
    pub links: Vec<TextLink>,
}

#[derive(Debug, Deserialize)]
struct MetadataDraft {
    title: String,
    description: String,
    #[serde(default, alias = "estimated_duration")]
    estimated_duration_hours: Value,
    #[serde(alias = "module_list", alias = "modules")]
    module_titles: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    prerequisites: Vec<String>,
}

/// Call counters for the content service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub metadata_calls: u64,
    pub module_calls: u64,
    pub attempts: u64,
    pub retries: u64,
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    metadata_calls: AtomicU64,
    module_calls: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

pub struct GenerationClient {
    service: Arc<dyn ContentService>,
    prompts: PromptSet,
    timeouts: Timeouts,
    retry: RetryPolicy,
    max_modules: usize,
    counters: Counters,
}

impl GenerationClient {
    pub fn new(
        service: Arc<dyn ContentService>,
        prompts: PromptSet,
        timeouts: Timeouts,
        retry: RetryPolicy,
        max_modules: usize,
    ) -> Self {
        Self {
            service,
            prompts,
            timeouts,
            retry,
            max_modules: max_modules.max(1),
            counters: Counters::default(),
        }
    }

    /// Generates the course metadata and module outline for `request`.
    pub async fn generate_metadata(
        &self,
        request: &GenerationRequest,
        criticality: Criticality,
    ) -> Result<CourseMetadata, GenerationError> {
        self.counters.metadata_calls.fetch_add(1, Ordering::Relaxed);
        let params = PromptParams::CourseMetadata(MetadataParams {
            topic: request.topic.trim().to_string(),
            level: request.level,
            tags: request.tags.iter().cloned().collect(),
            style: request.style,
            max_modules: self.max_modules,
        });
        let level = request.level;
        let max_modules = self.max_modules;
        self.generate(params, criticality, |text| {
            parse_metadata(text, level, max_modules)
        })
        .await
    }

    /// Generates the body of one module.
    pub async fn generate_module(
        &self,
        params: ModuleParams,
        criticality: Criticality,
    ) -> Result<ModuleDraft, GenerationError> {
        self.counters.module_calls.fetch_add(1, Ordering::Relaxed);
        self.generate(PromptParams::ModuleContent(params), criticality, parse_module)
            .await
    }

    async fn generate<T>(
        &self,
        params: PromptParams,
        criticality: Criticality,
        parse: impl Fn(&str) -> Result<T, UpstreamError>,
    ) -> Result<T, GenerationError> {
        let kind = params.kind();
        let request = ContentRequest {
            kind,
            system_prompt: self.prompts.for_kind(kind).to_string(),
            params,
            max_tokens: kind.max_tokens(),
        };
        let per_attempt = self.timeouts.for_criticality(criticality);

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let outcome =
                match tokio::time::timeout(per_attempt, self.service.complete(&request)).await {
                    Ok(Ok(text)) => parse(&text),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(UpstreamError::timeout(format!(
                        "no response within {}ms",
                        per_attempt.as_millis()
                    ))),
                };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        ?kind,
                        attempt,
                        cause = %err.kind,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying generation"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(?kind, attempt, cause = %err.kind, error = %err.message, "Generation failed");
                    return Err(GenerationError::new(err.kind, attempt, err.message));
                }
            }
        }
    }

    pub fn stats(&self) -> GenerationStats {
        let c = &self.counters;
        GenerationStats {
            metadata_calls: c.metadata_calls.load(Ordering::Relaxed),
            module_calls: c.module_calls.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }
}

/// The outermost `{...}` in `text`, ignoring code fences or prose around it.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

fn decode<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, UpstreamError> {
    let json = extract_json(text)
        .ok_or_else(|| UpstreamError::invalid_response("response contains no JSON object"))?;
    serde_json::from_str(json)
        .map_err(|err| UpstreamError::invalid_response(format!("unexpected response shape: {err}")))
}

fn non_blank(value: &str, field: &str) -> Result<String, UpstreamError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(UpstreamError::invalid_response(format!("'{field}' is empty")));
    }
    Ok(value.to_string())
}

/// Accepts `8`, `8.5` or `"8 hours"`; anything else counts as unknown.
fn duration_hours(value: &Value) -> u32 {
    match value {
        Value::Number(n) => n.as_f64().map(|h| h.round().max(0.0) as u32).unwrap_or(0),
        Value::String(s) => s
            .trim()
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(0),
        _ => 0,
    }
}

fn parse_metadata(
    text: &str,
    level: ExperienceLevel,
    max_modules: usize,
) -> Result<CourseMetadata, UpstreamError> {
    let draft: MetadataDraft = decode(text)?;
    let title = non_blank(&draft.title, "title")?;
    let description = non_blank(&draft.description, "description")?;

    if draft.module_titles.is_empty() || draft.module_titles.len() > max_modules {
        return Err(UpstreamError::invalid_response(format!(
            "expected 1 to {max_modules} module titles, got {}",
            draft.module_titles.len()
        )));
    }
    let module_titles = draft
        .module_titles
        .iter()
        .map(|t| non_blank(t, "module_titles"))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CourseMetadata {
        title,
        description,
        level,
        estimated_duration_hours: duration_hours(&draft.estimated_duration_hours),
        module_titles,
        topics: draft.topics,
        prerequisites: draft.prerequisites,
    })
}

fn parse_module(text: &str) -> Result<ModuleDraft, UpstreamError> {
    let draft: ModuleDraft = decode(text)?;
    let concepts: Vec<String> = draft
        .concepts
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if concepts.is_empty() {
        return Err(UpstreamError::invalid_response("'concepts' is empty"));
    }
    if draft.content.trim().is_empty() {
        return Err(UpstreamError::invalid_response("'content' is empty"));
    }
    for question in &draft.quiz {
        if question.options.len() < 2 || question.correct_option >= question.options.len() {
            return Err(UpstreamError::invalid_response(format!(
                "quiz question '{}' has no valid answer",
                question.question
            )));
        }
    }

    Ok(ModuleDraft {
        description: non_blank(&draft.description, "description")?,
        objective: non_blank(&draft.objective, "objective")?,
        concepts,
        summary: draft
            .summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        links: draft
            .links
            .into_iter()
            .filter(|link| link.url.starts_with("https://") || link.url.starts_with("http://"))
            .collect(),
        quiz: draft.quiz,
        content: draft.content,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureCause;
    use crate::llm_client::MockContentService;
    use mockall::Sequence;
    use serde_json::json;
    use std::time::Duration;

    fn prompts() -> PromptSet {
        PromptSet {
            course_metadata: "plan".into(),
            module_content: "write".into(),
        }
    }

    fn client(service: MockContentService) -> GenerationClient {
        GenerationClient::new(
            Arc::new(service),
            prompts(),
            Timeouts::default(),
            RetryPolicy::default(),
            15,
        )
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("basic statistics", ExperienceLevel::Beginner).with_tags(["sports"])
    }

    fn metadata_json() -> String {
        json!({
            "title": "Statistics Through Sports",
            "description": "Averages and spread using match data.",
            "estimated_duration_hours": "6 hours",
            "module_titles": ["Data", "Averages", "Spread"],
            "topics": ["mean", "variance"]
        })
        .to_string()
    }

    fn module_params() -> ModuleParams {
        ModuleParams {
            course_topic: "basic statistics".into(),
            course_title: "Statistics Through Sports".into(),
            level: ExperienceLevel::Beginner,
            tags: vec!["sports".into()],
            style: StyleParameters::default(),
            module_index: 1,
            module_count: 3,
            module_title: "Averages".into(),
            previous_title: Some("Data".into()),
            next_title: Some("Spread".into()),
            exclude_concepts: vec![],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_is_parsed_from_fenced_output() {
        let mut service = MockContentService::new();
        service
            .expect_complete()
            .withf(|req| {
                req.kind == GenerationKind::CourseMetadata
                    && req.system_prompt == "plan"
                    && matches!(&req.params, PromptParams::CourseMetadata(p) if p.tags == ["sports"])
            })
            .times(1)
            .returning(|_| Ok(format!("Here you go:\n```json\n{}\n```", metadata_json())));

        let client = client(service);
        let metadata = client
            .generate_metadata(&request(), Criticality::FastPath)
            .await
            .unwrap();

        assert_eq!(metadata.title, "Statistics Through Sports");
        assert_eq!(metadata.module_titles, ["Data", "Averages", "Spread"]);
        assert_eq!(metadata.estimated_duration_hours, 6);
        assert_eq!(metadata.level, ExperienceLevel::Beginner);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let mut service = MockContentService::new();
        let mut seq = Sequence::new();
        service
            .expect_complete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(UpstreamError::rate_limited("429")));
        service
            .expect_complete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("not json at all".into()));
        service
            .expect_complete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(metadata_json()));

        let client = client(service);
        let metadata = client
            .generate_metadata(&request(), Criticality::Background)
            .await
            .unwrap();

        assert_eq!(metadata.module_count(), 3);
        let stats = client.stats();
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_carry_the_last_cause() {
        let mut service = MockContentService::new();
        service
            .expect_complete()
            .times(3)
            .returning(|_| Err(UpstreamError::rate_limited("429")));

        let err = client(service)
            .generate_metadata(&request(), Criticality::OnDemand)
            .await
            .unwrap_err();

        assert_eq!(err.cause, FailureCause::RateLimited);
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_fail_immediately() {
        let mut service = MockContentService::new();
        service
            .expect_complete()
            .times(1)
            .returning(|_| Err(UpstreamError::rejected("invalid api key")));

        let err = client(service)
            .generate_module(module_params(), Criticality::Background)
            .await
            .unwrap_err();

        assert_eq!(err.cause, FailureCause::UpstreamError);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_per_attempt() {
        struct Stalled;

        #[async_trait::async_trait]
        impl ContentService for Stalled {
            async fn complete(&self, _request: &ContentRequest) -> Result<String, UpstreamError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(String::new())
            }
        }

        let client = GenerationClient::new(
            Arc::new(Stalled),
            prompts(),
            Timeouts::default(),
            RetryPolicy::default(),
            15,
        );
        let err = client
            .generate_metadata(&request(), Criticality::FastPath)
            .await
            .unwrap_err();

        assert_eq!(err.cause, FailureCause::Timeout);
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistently_invalid_modules_are_terminal() {
        let mut service = MockContentService::new();
        service.expect_complete().times(3).returning(|_| {
            Ok(json!({
                "description": "Means",
                "objective": "Compute a mean",
                "concepts": [],
                "content": "The mean is the sum divided by the count."
            })
            .to_string())
        });

        let err = client(service)
            .generate_module(module_params(), Criticality::Background)
            .await
            .unwrap_err();
        assert_eq!(err.cause, FailureCause::InvalidResponse);
    }

    #[test]
    fn module_parsing_drops_unsafe_links_and_checks_quiz() {
        let valid = json!({
            "description": "Means",
            "objective": "Compute a mean",
            "concepts": ["mean", " "],
            "content": "The mean is the sum divided by the count.",
            "summary": "  ",
            "quiz": [{"question": "Mean of 2 and 4?", "options": ["3", "6"], "correct_option": 0}],
            "links": [
                {"title": "Reading", "url": "https://example.org/mean"},
                {"title": "Script", "url": "javascript:alert(1)"}
            ]
        });
        let draft = parse_module(&valid.to_string()).unwrap();
        assert_eq!(draft.concepts, ["mean"]);
        assert_eq!(draft.summary, None);
        assert_eq!(draft.links.len(), 1);

        let mut bad_quiz = valid.clone();
        bad_quiz["quiz"][0]["correct_option"] = json!(5);
        let err = parse_module(&bad_quiz.to_string()).unwrap_err();
        assert_eq!(err.kind, FailureCause::InvalidResponse);
    }

    #[test]
    fn metadata_outline_size_is_bounded() {
        let too_many: Vec<String> = (0..20).map(|i| format!("Module {i}")).collect();
        let text = json!({
            "title": "t",
            "description": "d",
            "module_list": too_many
        })
        .to_string();
        assert!(parse_metadata(&text, ExperienceLevel::Beginner, 15).is_err());

        let empty = json!({"title": "t", "description": "d", "module_titles": []}).to_string();
        assert!(parse_metadata(&empty, ExperienceLevel::Beginner, 15).is_err());
    }

    #[test]
    fn params_serialize_as_separate_fields() {
        let params = PromptParams::ModuleContent(ModuleParams {
            module_title: "Averages\", \"exclude_concepts\": [\"x\"]".into(),
            ..module_params()
        });
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["kind"], "module_content");
        assert!(value.get("exclude_concepts").is_none());
        assert_eq!(value["module_title"], "Averages\", \"exclude_concepts\": [\"x\"]");
    }
}
