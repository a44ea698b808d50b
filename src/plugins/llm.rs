//! Text generation against an OpenAI-compatible HTTP endpoint.
//!
//! Registered only when `[plugins.llm] endpoint` is set. Requests are made
//! with the blocking client since scripts run synchronously on a worker
//! thread.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::traits::{Args, Capability, FunctionTable, QueryContext};
use crate::config::LlmConfig;
use crate::error::{Error, Result};
use crate::value::HostValue;

const FUNCTIONS: &[&str] = &["chat", "complete"];

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<ChatMessage>,
}

struct Client {
    http: reqwest::blocking::Client,
    config: LlmConfig,
}

impl Client {
    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.endpoint.trim_end_matches('/'))
    }

    fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<CompletionResponse> {
        let mut request = self.http.post(self.url(path)).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .map_err(|e| Error::general(format!("llm request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(Error::general(format!("llm endpoint returned {status}: {body}")));
        }
        response
            .json()
            .map_err(|e| Error::general(format!("llm response could not be parsed: {e}")))
    }

    fn complete(&self, prompt: &str, max_tokens: Option<u32>) -> Result<String> {
        let request = CompletionRequest {
            model: &self.config.model,
            prompt,
            max_tokens: max_tokens.unwrap_or(self.config.max_tokens),
        };
        let response = self.post("completions", &request)?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.text)
            .ok_or_else(|| Error::general("llm response had no completion text"))
    }

    fn chat(&self, messages: &[ChatMessage], max_tokens: Option<u32>) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages,
            max_tokens: max_tokens.unwrap_or(self.config.max_tokens),
        };
        let response = self.post("chat/completions", &request)?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .map(|message| message.content)
            .ok_or_else(|| Error::general("llm response had no chat message"))
    }
}

/// A bare string is a single user message; otherwise a list of
/// `{role, content}` tables.
fn chat_messages(value: &HostValue) -> Result<Vec<ChatMessage>> {
    if let Some(text) = value.as_str() {
        return Ok(vec![ChatMessage {
            role: "user".into(),
            content: text.to_string(),
        }]);
    }
    let items = value
        .as_sequence()
        .ok_or_else(|| Error::invalid_argument("'messages' must be a string or a list"))?;
    items
        .iter()
        .map(|item| {
            let field = |name: &str| {
                item.get(name).and_then(HostValue::as_str).map(str::to_string).ok_or_else(|| {
                    Error::invalid_argument(format!("each message needs a string '{name}'"))
                })
            };
            Ok(ChatMessage {
                role: field("role")?,
                content: field("content")?,
            })
        })
        .collect()
}

fn max_tokens(args: &Args, index: usize) -> Result<Option<u32>> {
    args.opt_integer(index, "max_tokens")?
        .map(|n| u32::try_from(n).map_err(|_| Error::invalid_argument("'max_tokens' out of range")))
        .transpose()
}

/// Completion and chat.
pub struct LlmCapability {
    config: LlmConfig,
    /// Built on first use, on the worker thread that runs the script.
    client: Mutex<Option<Arc<Client>>>,
}

impl LlmCapability {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    fn client(&self) -> Result<Arc<Client>> {
        let mut slot = self.client.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }

        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()
            .map_err(|e| Error::general(format!("failed to build http client: {e}")))?;
        let client = Arc::new(Client {
            http,
            config: self.config.clone(),
        });
        *slot = Some(Arc::clone(&client));
        tracing::debug!(endpoint = %self.config.endpoint, model = %self.config.model, "LLM client ready");
        Ok(client)
    }
}

impl Capability for LlmCapability {
    fn capability_name(&self) -> &str {
        "llm"
    }

    fn description(&self) -> &str {
        "Text completion and chat via an OpenAI-compatible endpoint"
    }

    fn function_names(&self) -> &'static [&'static str] {
        FUNCTIONS
    }

    fn initialize(&self, _ctx: &QueryContext) -> Result<()> {
        if self.config.endpoint.trim().is_empty() {
            return Err(Error::Config("no llm endpoint configured".into()));
        }
        self.client().map(|_| ())
    }

    fn exposed_functions(&self, _ctx: &QueryContext) -> FunctionTable {
        let Some(client) = self.client.lock().clone() else {
            return FunctionTable::new();
        };

        let completer = Arc::clone(&client);
        FunctionTable::new()
            .with("complete", move |args| {
                let prompt = args.string(0, "prompt")?;
                Ok(HostValue::from(completer.complete(&prompt, max_tokens(&args, 1)?)?))
            })
            .with("chat", move |args| {
                let messages = chat_messages(args.value(0))?;
                Ok(HostValue::from(client.chat(&messages, max_tokens(&args, 1)?)?))
            })
    }
}

impl std::fmt::Debug for LlmCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmCapability")
            .field("endpoint", &self.config.endpoint)
            .field("model", &self.config.model)
            .finish_non_exhaustive()
    }
}
