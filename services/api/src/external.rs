//! HTTP adapters for the video-search and speech-synthesis collaborators.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use coursegen_core::course::{ExperienceLevel, VideoReference};
use coursegen_core::resources::{SpeechSynthesizer, SynthesizedAudio, VideoQuery, VideoSearch};
use serde::Deserialize;
use tracing::debug;

const YOUTUBE_SEARCH_URL: &str = "https://www.googleapis.com/youtube/v3/search";
const ELEVENLABS_URL: &str = "https://api.elevenlabs.io/v1/text-to-speech";
const ELEVENLABS_MODEL: &str = "eleven_multilingual_v2";

/// Video search over the YouTube Data API.
pub struct YouTubeSearch {
    client: reqwest::Client,
    api_key: String,
}

impl YouTubeSearch {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: SearchItemId,
    snippet: Snippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Snippet {
    title: String,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Debug, Default, Deserialize)]
struct Thumbnails {
    medium: Option<Thumbnail>,
    default: Option<Thumbnail>,
}

#[derive(Debug, Deserialize)]
struct Thumbnail {
    url: String,
}

/// Search text for `query`, steered toward the learner's level.
fn search_terms(query: &VideoQuery) -> String {
    let hint = match query.level {
        ExperienceLevel::Beginner => "introduction tutorial",
        ExperienceLevel::Intermediate => "tutorial",
        ExperienceLevel::Advanced => "in depth",
    };
    format!("{} {hint}", query.text())
}

fn into_references(response: SearchResponse, limit: usize) -> Vec<VideoReference> {
    response
        .items
        .into_iter()
        .filter_map(|item| {
            let external_id = item.id.video_id?;
            let thumbnails = item.snippet.thumbnails;
            Some(VideoReference {
                title: item.snippet.title,
                external_id,
                thumbnail: thumbnails.medium.or(thumbnails.default).map(|t| t.url),
                duration: None,
            })
        })
        .take(limit)
        .collect()
}

#[async_trait]
impl VideoSearch for YouTubeSearch {
    async fn search(&self, query: &VideoQuery) -> Result<Vec<VideoReference>> {
        let terms = search_terms(query);
        let max_results = query.max_results.clamp(1, 50).to_string();
        let response = self
            .client
            .get(YOUTUBE_SEARCH_URL)
            .query(&[
                ("part", "snippet"),
                ("type", "video"),
                ("safeSearch", "strict"),
                ("q", terms.as_str()),
                ("maxResults", max_results.as_str()),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await
            .context("YouTube search request failed")?
            .error_for_status()
            .context("YouTube search was rejected")?;
        let body: SearchResponse = response
            .json()
            .await
            .context("Failed to parse YouTube search response")?;
        let videos = into_references(body, query.max_results);
        debug!(terms = %terms, found = videos.len(), "YouTube search complete");
        Ok(videos)
    }
}

/// Speech synthesis over the ElevenLabs text-to-speech API. Returns MP3 bytes.
pub struct ElevenLabsSpeech {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
}

impl ElevenLabsSpeech {
    pub fn new(api_key: String, voice_id: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            voice_id,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSpeech {
    async fn synthesize(&self, text: &str, language: &str) -> Result<SynthesizedAudio> {
        if text.trim().is_empty() {
            bail!("nothing to narrate");
        }
        let payload = serde_json::json!({
            "text": text,
            "model_id": ELEVENLABS_MODEL,
            "language_code": language,
        });
        let response = self
            .client
            .post(format!("{ELEVENLABS_URL}/{}", self.voice_id))
            .header("xi-api-key", &self.api_key)
            .header(reqwest::header::ACCEPT, "audio/mpeg")
            .json(&payload)
            .send()
            .await
            .context("ElevenLabs request failed")?
            .error_for_status()
            .context("ElevenLabs rejected the request")?;
        let bytes = response
            .bytes()
            .await
            .context("Failed to read ElevenLabs audio")?;
        Ok(SynthesizedAudio::Bytes(bytes.to_vec()))
    }
}
