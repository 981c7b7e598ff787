use std::pin::Pin;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use log::{debug, info, warn};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;
use crate::transcript::Message;

/// Reply fragments in arrival order. Finite and not restartable.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ServiceError>> + Send>>;

/// Something that can turn a conversation into a streamed assistant reply.
pub trait InferenceService {
    async fn stream_chat(&self, messages: &[Message]) -> Result<FragmentStream, ServiceError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

/// Client for an Ollama server's chat endpoint.
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl OllamaClient {
    /// `read_timeout` bounds the wait for each piece of a streamed reply.
    pub fn new(
        base_url: &str,
        model: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("qchat/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            connect_timeout,
            read_timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// List installed models. Fails if the server cannot be reached.
    pub async fn check_ready(&self) -> Result<Vec<String>, ServiceError> {
        let url = format!("{}/api/tags", self.base_url);
        debug!("checking model server at {url}");
        let response = self
            .http
            .get(&url)
            .timeout(self.connect_timeout)
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(e, &self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status { status, body: error_message(&body) });
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::from_reqwest(e, &self.base_url))?;
        let names: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        info!("connected to model server, found {} model(s)", names.len());
        debug!("available models: {names:?}");

        if !names.iter().any(|name| model_matches(name, &self.model)) {
            warn!(
                "model `{}` is not installed, you can install it with: ollama pull {}",
                self.model, self.model
            );
        }
        Ok(names)
    }
}

impl InferenceService for OllamaClient {
    async fn stream_chat(&self, messages: &[Message]) -> Result<FragmentStream, ServiceError> {
        let url = format!("{}/api/chat", self.base_url);
        let request = ChatRequest { model: &self.model, messages, stream: true };
        debug!("sending {} message(s) to {url}", messages.len());

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(e, &self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = error_message(&response.text().await.unwrap_or_default());
            if status == StatusCode::NOT_FOUND {
                body.push_str(&format!(
                    " (is `{}` installed? try: ollama pull {})",
                    self.model, self.model
                ));
            }
            return Err(ServiceError::Status { status, body });
        }

        Ok(Box::pin(fragments(response, self.base_url.clone(), self.read_timeout)))
    }
}

fn fragments(
    response: reqwest::Response,
    base_url: String,
    read_timeout: Duration,
) -> impl Stream<Item = Result<String, ServiceError>> + Send {
    async_stream::try_stream! {
        let mut body = response.bytes_stream();
        let mut decoder = NdjsonDecoder::new();

        loop {
            let next = tokio::time::timeout(read_timeout, body.next())
                .await
                .map_err(|_| ServiceError::Timeout)?;
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| ServiceError::from_reqwest(e, &base_url))?;
            for fragment in decoder.push(&chunk)? {
                yield fragment;
            }
            if decoder.is_done() {
                break;
            }
        }
        for fragment in decoder.finish()? {
            yield fragment;
        }
    }
}

/// Incremental decoder for a newline-delimited JSON chat stream.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence.
struct NdjsonDecoder {
    utf8: encoding_rs::Decoder,
    pending: String,
    done: bool,
}

impl NdjsonDecoder {
    fn new() -> Self {
        Self {
            utf8: encoding_rs::UTF_8.new_decoder_without_bom_handling(),
            pending: String::new(),
            done: false,
        }
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, ServiceError> {
        self.decode(bytes, false);
        self.drain_lines()
    }

    /// Flush the tail of the body. Errors if the completion chunk never arrived.
    fn finish(&mut self) -> Result<Vec<String>, ServiceError> {
        if self.done {
            return Ok(Vec::new());
        }
        self.decode(&[], true);
        self.pending.push('\n');
        let fragments = self.drain_lines()?;
        if !self.done {
            return Err(ServiceError::Truncated);
        }
        Ok(fragments)
    }

    fn decode(&mut self, bytes: &[u8], last: bool) {
        let needed = self
            .utf8
            .max_utf8_buffer_length(bytes.len())
            .unwrap_or(bytes.len() * 3 + 4);
        self.pending.reserve(needed);
        let (_, _, had_errors) = self.utf8.decode_to_string(bytes, &mut self.pending, last);
        if had_errors {
            debug!("invalid utf-8 in reply stream replaced with U+FFFD");
        }
    }

    fn drain_lines(&mut self) -> Result<Vec<String>, ServiceError> {
        let mut fragments = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() || self.done {
                continue;
            }
            let chunk: ChatChunk = serde_json::from_str(line)?;
            if let Some(error) = chunk.error {
                return Err(ServiceError::Remote(error));
            }
            if let Some(message) = chunk.message {
                if !message.content.is_empty() {
                    fragments.push(message.content);
                }
            }
            self.done = chunk.done;
        }
        Ok(fragments)
    }
}

const MAX_ERROR_CHARS: usize = 300;

/// Pull `error` out of a JSON error body, falling back to the raw text.
///
/// The result is a single line of at most `MAX_ERROR_CHARS` characters.
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: String,
    }
    let text = match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error,
        Err(_) => body.to_string(),
    };
    let mut line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some((cut, _)) = line.char_indices().nth(MAX_ERROR_CHARS) {
        line.truncate(cut);
        line.push_str("...");
    }
    line
}

/// `qwen3` is served as `qwen3:latest`.
fn model_matches(installed: &str, wanted: &str) -> bool {
    installed == wanted
        || (!wanted.contains(':') && installed.strip_suffix(":latest") == Some(wanted))
}
