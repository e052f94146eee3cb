use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs, ResponseFormat,
    },
};
use async_trait::async_trait;
use serde_json::json;

use crate::error::UpstreamError;
use crate::generation::{ContentRequest, ModuleParams, PromptParams};

/// A backend that turns a structured [`ContentRequest`] into raw text.
///
/// Implementations classify their failures as retryable or not; parsing and
/// validation of the text is left to the generation client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentService: Send + Sync {
    async fn complete(&self, request: &ContentRequest) -> Result<String, UpstreamError>;
}

/// A `ContentService` for any OpenAI-compatible chat completion API.
pub struct OpenAICompatibleService {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleService {
    /// Creates a new client for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - The configuration for the OpenAI client, including API key and base URL.
    /// * `model` - The model identifier to use for chat completions (e.g., "gpt-4o").
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }
}

#[async_trait]
impl ContentService for OpenAICompatibleService {
    async fn complete(&self, request: &ContentRequest) -> Result<String, UpstreamError> {
        let params = serde_json::to_string(&request.params)
            .map_err(|err| UpstreamError::rejected(err.to_string()))?;

        let chat = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(request.system_prompt.as_str())
                    .build()
                    .map_err(classify)?
                    .into(),
                ChatCompletionRequestUserMessageArgs::default()
                    .content(params)
                    .build()
                    .map_err(classify)?
                    .into(),
            ])
            .response_format(ResponseFormat::JsonObject)
            .max_completion_tokens(request.max_tokens)
            .build()
            .map_err(classify)?;

        let response = self.client.chat().create(chat).await.map_err(classify)?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| UpstreamError::invalid_response("No content in LLM response"))
    }
}

fn classify(err: OpenAIError) -> UpstreamError {
    match err {
        OpenAIError::Reqwest(err) if err.is_timeout() => UpstreamError::timeout(err.to_string()),
        OpenAIError::Reqwest(err) => UpstreamError::server(err.to_string()),
        OpenAIError::JSONDeserialize(err) => UpstreamError::invalid_response(err.to_string()),
        OpenAIError::InvalidArgument(message) => UpstreamError::rejected(message),
        OpenAIError::ApiError(api) => {
            let details = format!("{api:?}").to_lowercase();
            if details.contains("rate_limit") || details.contains("rate limit") || details.contains("quota") {
                UpstreamError::rate_limited(api.message)
            } else if ["invalid_request", "invalid_api_key", "authentication", "permission"]
                .iter()
                .any(|marker| details.contains(marker))
            {
                UpstreamError::rejected(api.message)
            } else {
                UpstreamError::server(api.message)
            }
        }
        other => UpstreamError::server(other.to_string()),
    }
}

/// A deterministic `ContentService` for development and integration testing.
///
/// Produces a fixed outline and predictable module bodies for any topic,
/// without network access or API costs.
#[derive(Debug, Clone)]
pub struct StaticContentService {
    modules: usize,
    paragraphs: usize,
}

impl Default for StaticContentService {
    fn default() -> Self {
        Self::new(4, 6)
    }
}

impl StaticContentService {
    pub fn new(modules: usize, paragraphs: usize) -> Self {
        Self {
            modules: modules.max(1),
            paragraphs: paragraphs.max(1),
        }
    }

    pub fn module_titles(&self, topic: &str) -> Vec<String> {
        let mut titles = vec![
            format!("Introduction to {topic}"),
            "Core Concepts".to_string(),
            "Practical Applications".to_string(),
            "Advanced Topics".to_string(),
        ];
        titles.extend((titles.len()..self.modules).map(|i| format!("Further Study {i}")));
        titles.truncate(self.modules);
        titles
    }

    fn module(&self, params: &ModuleParams) -> serde_json::Value {
        let title = &params.module_title;
        let interest = params
            .tags
            .first()
            .cloned()
            .unwrap_or_else(|| "everyday life".to_string());
        let content = (1..=self.paragraphs)
            .map(|n| {
                format!(
                    "Part {n} of {title}. This section explains one idea from {topic} at the {level} level. \
                     It uses an example from {interest} so the idea is easy to picture. \
                     Work through the example slowly and note each step. \
                     By the end of this part you should be able to explain it in your own words. \
                     The next part builds directly on what you have just read.",
                    topic = params.course_topic,
                    level = params.level,
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let concepts: Vec<String> = [format!("{title} fundamentals"), format!("{title} in practice")]
            .into_iter()
            .filter(|c| {
                !params
                    .exclude_concepts
                    .iter()
                    .any(|excluded| excluded.eq_ignore_ascii_case(c))
            })
            .collect();

        json!({
            "description": format!("Module {} of {}: {title}.", params.module_index + 1, params.module_count),
            "objective": format!("Explain the main ideas of {title}."),
            "concepts": concepts,
            "content": content,
            "summary": format!("{title} in a few sentences."),
            "quiz": [{
                "question": format!("What is the focus of {title}?"),
                "options": [title, "Something unrelated"],
                "correct_option": 0,
                "explanation": format!("This module is about {title}."),
            }],
            "links": [{
                "title": format!("Further reading on {title}"),
                "url": "https://en.wikipedia.org/wiki/Special:Search",
            }],
        })
    }
}

#[async_trait]
impl ContentService for StaticContentService {
    async fn complete(&self, request: &ContentRequest) -> Result<String, UpstreamError> {
        let body = match &request.params {
            PromptParams::CourseMetadata(params) => {
                let titles = self.module_titles(&params.topic);
                json!({
                    "title": format!("Introduction to {}", params.topic),
                    "description": format!(
                        "A {} course on {} in {} modules.",
                        params.level,
                        params.topic,
                        titles.len()
                    ),
                    "estimated_duration_hours": titles.len() * 2,
                    "module_titles": titles,
                    "topics": [params.topic],
                })
            }
            PromptParams::ModuleContent(params) => self.module(params),
        };
        Ok(body.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryPolicy, Timeouts};
    use crate::course::{ExperienceLevel, GenerationRequest, StyleParameters};
    use crate::generation::{Criticality, GenerationClient};
    use crate::prompts::PromptSet;
    use std::sync::Arc;

    fn client(service: StaticContentService) -> GenerationClient {
        GenerationClient::new(
            Arc::new(service),
            PromptSet {
                course_metadata: String::new(),
                module_content: String::new(),
            },
            Timeouts::default(),
            RetryPolicy::default(),
            15,
        )
    }

    #[tokio::test]
    async fn static_output_passes_validation() {
        let client = client(StaticContentService::new(6, 3));
        let request = GenerationRequest::new("chess", ExperienceLevel::Intermediate);

        let metadata = client
            .generate_metadata(&request, Criticality::FastPath)
            .await
            .unwrap();
        assert_eq!(metadata.module_count(), 6);
        assert_eq!(metadata.module_titles[0], "Introduction to chess");
        assert_eq!(metadata.module_titles[5], "Further Study 5");

        let draft = client
            .generate_module(
                ModuleParams {
                    course_topic: "chess".into(),
                    course_title: metadata.title.clone(),
                    level: ExperienceLevel::Intermediate,
                    tags: vec![],
                    style: StyleParameters::default(),
                    module_index: 1,
                    module_count: 6,
                    module_title: "Core Concepts".into(),
                    previous_title: None,
                    next_title: None,
                    exclude_concepts: vec!["core concepts fundamentals".into()],
                },
                Criticality::Background,
            )
            .await
            .unwrap();
        assert_eq!(draft.concepts, ["Core Concepts in practice"]);
        assert_eq!(draft.content.split("\n\n").count(), 3);
        assert_eq!(draft.quiz.len(), 1);
    }
}
