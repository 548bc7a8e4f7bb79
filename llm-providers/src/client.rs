//! Thin HTTP clients per provider (enum-dispatch).
//!
//! One request shape in, one string out. No streaming, no tool use — the
//! built-in review agent only needs a single completion per prompt. Clients
//! share a caller-supplied `reqwest::Client` so connection pools are reused
//! across calls.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LlmError, LlmResult};
use crate::provider::{ProviderKind, ResolvedProvider};

/// A single generation request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

/// Concrete provider client (enum-dispatch, no async-trait).
pub enum LlmClient {
    Anthropic(AnthropicClient),
    OpenAi(OpenAiClient),
    AzureOpenAi(AzureOpenAiClient),
    Ollama(OllamaClient),
}

impl LlmClient {
    /// Build a client for the resolved provider.
    pub fn from_resolved(resolved: &ResolvedProvider) -> LlmResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent("pr-ai-review/0.1")
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(match resolved.kind {
            ProviderKind::Anthropic => Self::Anthropic(AnthropicClient {
                http,
                api_key: resolved.credentials.api_key.clone().unwrap_or_default(),
                model: resolved.model.clone(),
            }),
            ProviderKind::OpenAi => Self::OpenAi(OpenAiClient {
                http,
                api_key: resolved.credentials.api_key.clone().unwrap_or_default(),
                model: resolved.model.clone(),
            }),
            ProviderKind::AzureOpenAi => Self::AzureOpenAi(AzureOpenAiClient {
                http,
                api_key: resolved.credentials.api_key.clone().unwrap_or_default(),
                endpoint: resolved.credentials.endpoint.clone().unwrap_or_default(),
                deployment: resolved
                    .credentials
                    .deployment
                    .clone()
                    .unwrap_or_else(|| resolved.model.clone()),
            }),
            ProviderKind::Ollama => Self::Ollama(OllamaClient {
                http,
                endpoint: resolved
                    .credentials
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| "http://127.0.0.1:11434".to_string()),
                model: resolved.model.clone(),
            }),
        })
    }

    /// Generate a completion for the given request.
    pub async fn generate(&self, req: &LlmRequest) -> LlmResult<String> {
        match self {
            Self::Anthropic(c) => c.generate(req).await,
            Self::OpenAi(c) => c.generate(req).await,
            Self::AzureOpenAi(c) => c.generate(req).await,
            Self::Ollama(c) => c.generate(req).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct AnthropicReq<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<AnthropicMsg<'a>>,
}

#[derive(Serialize)]
struct AnthropicMsg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct AnthropicResp {
    content: Vec<AnthropicContent>,
}

#[derive(Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: String,
}

impl AnthropicClient {
    pub async fn generate(&self, req: &LlmRequest) -> LlmResult<String> {
        let body = AnthropicReq {
            model: &self.model,
            max_tokens: req.max_tokens,
            system: &req.system,
            messages: vec![AnthropicMsg {
                role: "user",
                content: &req.user,
            }],
        };
        debug!(model = %self.model, "anthropic: POST /v1/messages");
        let resp = self
            .http
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let parsed: AnthropicResp = resp.json().await?;
        parsed
            .content
            .into_iter()
            .map(|c| c.text)
            .reduce(|mut acc, t| {
                acc.push_str(&t);
                acc
            })
            .ok_or_else(|| LlmError::InvalidResponse("empty content blocks".into()))
    }
}

// ---------------------------------------------------------------------------
// OpenAI (and Azure, which shares the chat-completions shape)
// ---------------------------------------------------------------------------

pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct ChatReq<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<ChatMsg<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMsg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResp {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMsg,
}

#[derive(Deserialize)]
struct ChatChoiceMsg {
    #[serde(default)]
    content: String,
}

fn chat_messages<'a>(req: &'a LlmRequest) -> Vec<ChatMsg<'a>> {
    vec![
        ChatMsg {
            role: "system",
            content: &req.system,
        },
        ChatMsg {
            role: "user",
            content: &req.user,
        },
    ]
}

fn first_choice(resp: ChatResp) -> LlmResult<String> {
    resp.choices
        .into_iter()
        .next()
        .map(|c| c.message.content)
        .ok_or_else(|| LlmError::InvalidResponse("no choices in response".into()))
}

impl OpenAiClient {
    pub async fn generate(&self, req: &LlmRequest) -> LlmResult<String> {
        let body = ChatReq {
            model: Some(&self.model),
            messages: chat_messages(req),
            max_tokens: req.max_tokens,
        };
        debug!(model = %self.model, "openai: POST /v1/chat/completions");
        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        first_choice(resp.json().await?)
    }
}

pub struct AzureOpenAiClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    deployment: String,
}

impl AzureOpenAiClient {
    pub async fn generate(&self, req: &LlmRequest) -> LlmResult<String> {
        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version=2024-06-01",
            self.endpoint.trim_end_matches('/'),
            self.deployment
        );
        let body = ChatReq {
            // Azure routes by deployment; the model field is omitted.
            model: None,
            messages: chat_messages(req),
            max_tokens: req.max_tokens,
        };
        debug!(deployment = %self.deployment, "azure: POST chat/completions");
        let resp = self
            .http
            .post(&url)
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        first_choice(resp.json().await?)
    }
}

// ---------------------------------------------------------------------------
// Ollama
// ---------------------------------------------------------------------------

pub struct OllamaClient {
    http: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Serialize)]
struct OllamaReq<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaResp {
    response: String,
}

impl OllamaClient {
    /// Call `POST /api/generate` with a combined system+user prompt.
    pub async fn generate(&self, req: &LlmRequest) -> LlmResult<String> {
        let url = format!("{}/api/generate", self.endpoint.trim_end_matches('/'));
        let body = OllamaReq {
            model: &self.model,
            prompt: format!("{}\n\n{}", req.system, req.user),
            stream: false,
        };
        debug!(model = %self.model, "ollama: POST /api/generate");
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let parsed: OllamaResp = resp.json().await?;
        Ok(parsed.response)
    }
}
