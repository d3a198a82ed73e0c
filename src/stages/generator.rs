use std::collections::VecDeque;
use std::sync::LazyLock;

use anvil_common::Plan;
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use tracing::debug;

use super::openai::{ChatClient, ChatMessage, ChatRequest, StreamChunk};
use super::{Generator, TokenStream, prompts};
use crate::errors::GenerationError;

pub const DEFAULT_GENERATOR_TEMPERATURE: f32 = 0.1;

/// Generator backed by a streaming OpenAI-compatible endpoint.
pub struct HttpGenerator {
    client: ChatClient,
    model: String,
    temperature: f32,
}

impl HttpGenerator {
    pub fn new(client: ChatClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            temperature: DEFAULT_GENERATOR_TEMPERATURE,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_request(&self, plan: &Plan, allow_network: bool) -> Result<ChatRequest, GenerationError> {
        let plan_json = serde_json::to_string_pretty(plan)
            .map_err(|e| GenerationError::StreamInterrupted(format!("cannot encode plan: {}", e)))?;
        Ok(ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::system(prompts::GENERATOR_SYSTEM_PROMPT),
                ChatMessage::system(prompts::network_notice(allow_network)),
                ChatMessage::user(plan_json),
            ],
            temperature: self.temperature,
            response_format: None,
            stream: true,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, plan: &Plan, allow_network: bool) -> Result<TokenStream, GenerationError> {
        let request = self.build_request(plan, allow_network)?;
        let response = self.client.send(&request).await?;
        Ok(sse_tokens(response))
    }
}

/// A decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Token(String),
    Done,
}

/// Incremental `data:` line decoder for chat-completion streams.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence, so
/// lines are only decoded once their terminating newline has arrived.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, GenerationError> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(event) = decode_line(&line)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Decode whatever is left once the body has ended.
    pub fn finish(&mut self) -> Result<Vec<SseEvent>, GenerationError> {
        let rest = std::mem::take(&mut self.buf);
        Ok(decode_line(&rest)?.into_iter().collect())
    }
}

fn decode_line(line: &[u8]) -> Result<Option<SseEvent>, GenerationError> {
    let line = std::str::from_utf8(line)
        .map_err(|e| GenerationError::StreamInterrupted(format!("invalid UTF-8 in stream: {}", e)))?
        .trim_end_matches(['\r', '\n']);

    // Blank separators, `event:`/`id:` fields and `:` keep-alive comments carry no tokens.
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return Ok(Some(SseEvent::Done));
    }

    let chunk: StreamChunk = serde_json::from_str(payload).map_err(|e| {
        GenerationError::StreamInterrupted(format!("unparsable event '{}': {}", payload, e))
    })?;
    if let Some(error) = chunk.error {
        return Err(GenerationError::StreamInterrupted(format!(
            "server reported error mid-stream: {}",
            error
        )));
    }
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|t| !t.is_empty())
        .map(SseEvent::Token))
}

struct StreamState {
    response: Option<reqwest::Response>,
    decoder: SseDecoder,
    pending: VecDeque<Result<String, GenerationError>>,
    done: bool,
}

impl StreamState {
    fn push(&mut self, events: Vec<SseEvent>) {
        for event in events {
            match event {
                SseEvent::Token(token) => self.pending.push_back(Ok(token)),
                SseEvent::Done => {
                    self.done = true;
                    self.response = None;
                    break;
                }
            }
        }
    }

    /// Queue `err` after any tokens already decoded and stop reading.
    fn fail(&mut self, err: GenerationError) {
        self.response = None;
        self.done = true;
        self.pending.push_back(Err(err));
    }
}

/// Tokens of a streamed completion, read chunk by chunk from the body.
///
/// A body that ends before `[DONE]` yields its tokens followed by a final
/// `StreamInterrupted`.
fn sse_tokens(response: reqwest::Response) -> TokenStream {
    let state = StreamState {
        response: Some(response),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            let response = state.response.as_mut()?;
            match response.chunk().await {
                Ok(Some(bytes)) => match state.decoder.feed(&bytes) {
                    Ok(events) => state.push(events),
                    Err(e) => state.fail(e),
                },
                Ok(None) => {
                    state.response = None;
                    match state.decoder.finish() {
                        Ok(events) => state.push(events),
                        Err(e) => state.fail(e),
                    }
                    if !state.done {
                        debug!("token stream closed without [DONE]");
                        state.fail(GenerationError::StreamInterrupted(
                            "stream ended before [DONE]".to_string(),
                        ));
                    }
                }
                Err(e) => state.fail(GenerationError::StreamInterrupted(e.to_string())),
            }
        }
    })
    .boxed()
}

static CODE_FENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)\r?\n?```").ok());

/// Extract program text from model output that may be wrapped in Markdown fences.
///
/// The first fenced block wins; unfenced text is returned trimmed.
pub fn strip_code_fences(text: &str) -> String {
    if let Some(re) = CODE_FENCE.as_ref()
        && let Some(caps) = re.captures(text)
        && let Some(body) = caps.get(1)
    {
        return format!("{}\n", body.as_str().trim_end());
    }
    let trimmed = text.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}\n", trimmed)
    }
}

/// Consume a token stream to completion, echoing each token to `on_token`,
/// and return the program with fences stripped.
pub async fn collect_program(
    mut tokens: TokenStream,
    on_token: &(dyn Fn(&str) + Send + Sync),
) -> Result<String, GenerationError> {
    let mut text = String::new();
    while let Some(token) = tokens.next().await {
        let token = token?;
        on_token(&token);
        text.push_str(&token);
    }
    let program = strip_code_fences(&text);
    if program.trim().is_empty() {
        return Err(GenerationError::EmptyProgram);
    }
    Ok(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::openai::{ChatTimeouts, fake_server};
    use std::sync::Mutex;
    use std::time::Duration;

    fn data(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices": [{"delta": {"content": content}}]})
        )
    }

    fn plan() -> Plan {
        serde_json::from_str(
            r#"{"analysis":"a","steps":[{"id":1,"action":"print","details":"print 2"}],
                "estimated_complexity":"low","safety_flag":true}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::new();
        let full = data("print(");
        let (a, b) = full.split_at(10);
        assert!(decoder.feed(a.as_bytes()).unwrap().is_empty());
        assert_eq!(
            decoder.feed(b.as_bytes()).unwrap(),
            vec![SseEvent::Token("print(".into())]
        );
    }

    #[test]
    fn test_decoder_handles_split_utf8() {
        let mut decoder = SseDecoder::new();
        let full = data("é");
        let bytes = full.as_bytes();
        let split = full.find('é').unwrap() + 1; // inside the two-byte sequence
        assert!(decoder.feed(&bytes[..split]).unwrap().is_empty());
        assert_eq!(
            decoder.feed(&bytes[split..]).unwrap(),
            vec![SseEvent::Token("é".into())]
        );
    }

    #[test]
    fn test_decoder_done_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder
            .feed(b": keep-alive\r\nevent: message\r\ndata: [DONE]\r\n\r\n")
            .unwrap();
        assert_eq!(events, vec![SseEvent::Done]);
    }

    #[test]
    fn test_decoder_skips_role_only_delta() {
        let mut decoder = SseDecoder::new();
        let events = decoder
            .feed(b"data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n")
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_decoder_rejects_garbage() {
        let mut decoder = SseDecoder::new();
        assert!(matches!(
            decoder.feed(b"data: {not json\n"),
            Err(GenerationError::StreamInterrupted(_))
        ));
    }

    #[test]
    fn test_decoder_surfaces_error_event() {
        let mut decoder = SseDecoder::new();
        let err = decoder
            .feed(b"data: {\"error\":{\"message\":\"model unloaded\"}}\n")
            .unwrap_err();
        assert!(err.to_string().contains("model unloaded"));
    }

    #[test]
    fn test_decoder_finish_decodes_unterminated_tail() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: [DONE]").unwrap().is_empty());
        assert_eq!(decoder.finish().unwrap(), vec![SseEvent::Done]);
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```python\nprint(1+1)\n```"), "print(1+1)\n");
        assert_eq!(strip_code_fences("Sure!\n```\nx = 1\nprint(x)\n```\nDone."), "x = 1\nprint(x)\n");
        assert_eq!(strip_code_fences("print(1+1)"), "print(1+1)\n");
        assert_eq!(strip_code_fences("  \n "), "");
    }

    #[tokio::test]
    async fn test_http_generator_streams_tokens() {
        let body = format!("{}{}{}data: [DONE]\n\n", data("print("), data("1+1"), data(")"));
        let server = fake_server::serve_once("200 OK", "text/event-stream", &body).await;
        let generator =
            HttpGenerator::new(ChatClient::new(&server.base_url, "lm-studio").unwrap(), "local-model");

        let seen = Mutex::new(Vec::new());
        let tokens = generator.generate(&plan(), false).await.unwrap();
        let program = collect_program(tokens, &|t: &str| seen.lock().unwrap().push(t.to_string()))
            .await
            .unwrap();

        assert_eq!(program, "print(1+1)\n");
        assert_eq!(*seen.lock().unwrap(), vec!["print(", "1+1", ")"]);

        let raw = server.request.await.unwrap();
        assert!(raw.contains("\"stream\":true"));
        assert!(raw.contains("Network access allowed: false"));
    }

    #[tokio::test]
    async fn test_http_generator_missing_done_is_interrupted() {
        let body = data("print(1");
        let server = fake_server::serve_once("200 OK", "text/event-stream", &body).await;
        let generator = HttpGenerator::new(ChatClient::new(&server.base_url, "k").unwrap(), "m");
        let tokens = generator.generate(&plan(), true).await.unwrap();
        let err = collect_program(tokens, &|_: &str| {}).await.unwrap_err();
        assert!(matches!(err, GenerationError::StreamInterrupted(_)));
    }

    #[tokio::test]
    async fn test_http_generator_api_error() {
        let server =
            fake_server::serve_once("503 Service Unavailable", "text/plain", "no model loaded").await;
        let generator = HttpGenerator::new(ChatClient::new(&server.base_url, "k").unwrap(), "m");
        match generator.generate(&plan(), false).await {
            Err(GenerationError::Api { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "no model loaded");
            }
            Err(other) => panic!("Expected Api error, got {:?}", other),
            Ok(_) => panic!("Expected Api error, got a stream"),
        }
    }

    #[tokio::test]
    async fn test_collect_empty_program() {
        let tokens: TokenStream = futures::stream::iter(vec![Ok("   ".to_string())]).boxed();
        assert!(matches!(
            collect_program(tokens, &|_: &str| {}).await,
            Err(GenerationError::EmptyProgram)
        ));
    }

    #[tokio::test]
    async fn test_http_generator_stalled_stream_is_interrupted() {
        let server = fake_server::serve_then_stall("text/event-stream", &data("print(")).await;
        let timeouts = ChatTimeouts {
            read: Duration::from_millis(300),
            ..ChatTimeouts::default()
        };
        let client = ChatClient::with_timeouts(&server.base_url, "k", timeouts).unwrap();
        let generator = HttpGenerator::new(client, "m");

        let seen = Mutex::new(Vec::new());
        let tokens = generator.generate(&plan(), false).await.unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            collect_program(tokens, &|t: &str| seen.lock().unwrap().push(t.to_string())),
        )
        .await
        .expect("stalled stream never timed out");

        assert!(matches!(result, Err(GenerationError::StreamInterrupted(_))));
        assert_eq!(*seen.lock().unwrap(), vec!["print("]);
    }
}
