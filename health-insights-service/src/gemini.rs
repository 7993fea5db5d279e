//! Gemini-backed implementation of the remote analysis client.
//!
//! Talks to the generative-language REST API with reqwest. Specialist
//! calls request JSON-typed output and tolerate code-fenced responses;
//! the chat session uses the SSE streaming endpoint. Every fault is
//! converted to an in-band value at this boundary, matching the
//! `AnalysisClient` contract.

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use panel_flow::{
    AnalysisClient, AttachedImage, ChatEvent, ChatHandle, ChatTranscript, PatientHistory, Result,
    SpecialistAnalysis, SpecialistOutcome, Specialty, prompts,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error};

pub const SPECIALIST_MODEL: &str = "gemini-2.5-flash";
pub const SYNTHESIS_MODEL: &str = "gemini-2.5-pro";
pub const CHAT_MODEL: &str = "gemini-2.5-flash";

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn user(parts: Vec<Part>) -> Self {
        Self {
            role: Some("user".to_string()),
            parts,
        }
    }

    fn model(text: impl Into<String>) -> Self {
        Self {
            role: Some("model".to_string()),
            parts: vec![Part::text(text)],
        }
    }

    fn system(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part::text(text)],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }

    fn inline_image(image: &AttachedImage) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData {
                mime_type: image.mime_type.clone(),
                data: image.data.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

fn extract_text(response: &GenerateResponse) -> Option<String> {
    let content = response.candidates.first()?.content.as_ref()?;
    let text: String = content
        .parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect();
    if text.is_empty() { None } else { Some(text) }
}

/// Strip surrounding markdown code-fence markers from a model response
/// before JSON parsing.
fn strip_code_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```", "").trim().to_string()
}

/// Parse one specialist's raw response into an outcome. Unparseable
/// output degrades to `Failed` with the raw text embedded for diagnosis.
fn parse_specialist_payload(specialty: Specialty, raw: &str) -> SpecialistOutcome {
    let cleaned = strip_code_fences(raw);
    match serde_json::from_str::<SpecialistAnalysis>(&cleaned) {
        Ok(analysis) => SpecialistOutcome::Analysis(analysis),
        Err(parse_error) => SpecialistOutcome::Failed(format!(
            "Failed to parse analysis from {specialty} ({parse_error}). Raw output: {cleaned}"
        )),
    }
}

/// Move the decodable prefix of `bytes` out as a string, leaving a
/// trailing incomplete UTF-8 sequence in place for the next chunk. A
/// multibyte character split across two network chunks must come out
/// intact, never as replacement characters.
fn take_complete_utf8(bytes: &mut Vec<u8>) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            let text = text.to_string();
            bytes.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = bytes.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(bytes).into_owned();
            *bytes = tail;
            text
        }
        // Genuinely invalid bytes, not a chunk boundary.
        Err(_) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            bytes.clear();
            text
        }
    }
}

/// Pull complete `data:` payloads out of an SSE byte buffer, leaving any
/// trailing partial line in place for the next chunk.
fn drain_sse_data(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(newline) = buffer.find('\n') {
        let line: String = buffer.drain(..=newline).collect();
        let line = line.trim_end();
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() && data != "[DONE]" {
                payloads.push(data.to_string());
            }
        }
    }
    payloads
}

/// Client for the Gemini REST endpoints.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    async fn generate(&self, model: &str, request: &GenerateRequest) -> anyhow::Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .context("request to the analysis endpoint failed")?
            .error_for_status()
            .context("analysis endpoint returned an error status")?;
        let body: GenerateResponse = response
            .json()
            .await
            .context("analysis endpoint returned an unreadable body")?;
        extract_text(&body).ok_or_else(|| anyhow!("analysis endpoint returned no text"))
    }
}

#[async_trait]
impl AnalysisClient for GeminiClient {
    async fn specialist_analysis(
        &self,
        specialty: Specialty,
        report_text: &str,
        history: &PatientHistory,
        image: Option<&AttachedImage>,
    ) -> SpecialistOutcome {
        let formatted_history = prompts::format_history(history);
        let prompt = prompts::specialist_prompt(specialty, report_text, &formatted_history);

        // Image bytes go first, mirroring how the prompt references them.
        let mut parts = Vec::new();
        if let Some(image) = image {
            parts.push(Part::inline_image(image));
        }
        parts.push(Part::text(prompt));

        let request = GenerateRequest {
            contents: vec![Content::user(parts)],
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_mime_type: "application/json".to_string(),
            }),
        };

        match self.generate(SPECIALIST_MODEL, &request).await {
            Ok(raw) => parse_specialist_payload(specialty, &raw),
            Err(e) => {
                error!(%specialty, error = %e, "specialist call failed");
                SpecialistOutcome::Failed(format!(
                    "An error occurred while getting analysis from the {specialty} agent: {e:#}"
                ))
            }
        }
    }

    async fn synthesis(
        &self,
        analyses: &BTreeMap<Specialty, SpecialistAnalysis>,
        report_text: &str,
        history: &PatientHistory,
    ) -> std::result::Result<String, String> {
        let formatted_history = prompts::format_history(history);
        let prompt = prompts::synthesis_prompt(analyses, report_text, &formatted_history);
        let request = GenerateRequest {
            contents: vec![Content::user(vec![Part::text(prompt)])],
            system_instruction: None,
            generation_config: None,
        };

        self.generate(SYNTHESIS_MODEL, &request).await.map_err(|e| {
            error!(error = %e, "synthesis call failed");
            format!("An error occurred while generating the final integrated diagnosis: {e:#}")
        })
    }

    async fn open_chat(&self, context: String) -> Result<Box<dyn ChatHandle>> {
        Ok(Box::new(GeminiChatSession {
            client: self.clone(),
            system: Content::system(context),
            send_lock: Mutex::new(()),
            state: Mutex::new(ChatState {
                history: Vec::new(),
                transcript: ChatTranscript::with_greeting(),
            }),
        }))
    }
}

struct ChatState {
    /// Provider-side turn history; only fully received text enters it.
    history: Vec<Content>,
    transcript: ChatTranscript,
}

/// One Gemini streaming chat session, seeded with the case context as
/// system instruction. Each send is an independent SSE call.
struct GeminiChatSession {
    client: GeminiClient,
    system: Content,
    /// Serializes whole sends so each user turn and its streamed reply
    /// land as one atomic pair in the transcript and turn history.
    send_lock: Mutex<()>,
    state: Mutex<ChatState>,
}

impl GeminiChatSession {
    /// Stream one reply, forwarding deltas as they arrive. On failure
    /// returns the text accumulated so far plus the error message.
    async fn stream_reply(
        &self,
        history: Vec<Content>,
        events: &mpsc::Sender<ChatEvent>,
    ) -> std::result::Result<String, (String, String)> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.client.base_url, CHAT_MODEL
        );
        let request = GenerateRequest {
            contents: history,
            system_instruction: Some(self.system.clone()),
            generation_config: None,
        };

        let mut accumulated = String::new();
        let response = match self
            .client
            .http
            .post(&url)
            .header("x-goog-api-key", &self.client.api_key)
            .json(&request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
        {
            Ok(response) => response,
            Err(e) => return Err((accumulated, format!("chat request failed: {e}"))),
        };

        let mut stream = response.bytes_stream();
        let mut raw = Vec::new();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => return Err((accumulated, format!("chat stream interrupted: {e}"))),
            };
            raw.extend_from_slice(&bytes);
            buffer.push_str(&take_complete_utf8(&mut raw));
            for payload in drain_sse_data(&mut buffer) {
                let parsed: GenerateResponse = match serde_json::from_str(&payload) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(error = %e, "skipping undecodable stream payload");
                        continue;
                    }
                };
                if let Some(text) = extract_text(&parsed) {
                    accumulated.push_str(&text);
                    let event = ChatEvent::Delta(text);
                    self.state.lock().await.transcript.apply(&event);
                    let _ = events.send(event).await;
                }
            }
        }
        Ok(accumulated)
    }
}

#[async_trait]
impl ChatHandle for GeminiChatSession {
    async fn send(&self, message: &str, events: mpsc::Sender<ChatEvent>) {
        let _turn = self.send_lock.lock().await;
        let history = {
            let mut state = self.state.lock().await;
            state.transcript.push_user(message);
            state.transcript.begin_assistant();
            state
                .history
                .push(Content::user(vec![Part::text(message)]));
            state.history.clone()
        };

        match self.stream_reply(history, &events).await {
            Ok(full) => {
                let mut state = self.state.lock().await;
                if !full.is_empty() {
                    state.history.push(Content::model(full));
                }
                state.transcript.apply(&ChatEvent::Done);
                let _ = events.send(ChatEvent::Done).await;
            }
            Err((partial, message)) => {
                error!(error = %message, "chat stream failed");
                let mut state = self.state.lock().await;
                // The partial text stays in the turn history so the next
                // message keeps whatever the user already saw.
                if !partial.is_empty() {
                    state.history.push(Content::model(partial));
                }
                let event = ChatEvent::Error(message);
                state.transcript.apply(&event);
                let _ = events.send(event).await;
            }
        }
    }

    async fn transcript(&self) -> ChatTranscript {
        self.state.lock().await.transcript.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panel_flow::CHAT_GREETING;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn code_fences_are_stripped_before_parsing() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\nplain\n```"), "plain");
    }

    #[test]
    fn valid_specialist_payload_parses() {
        let raw = r#"```json
        {"summary": "mild", "keyFindings": ["a"], "potentialConditions": [], "recommendations": ["b"]}
        ```"#;
        match parse_specialist_payload(Specialty::Cardiologist, raw) {
            SpecialistOutcome::Analysis(analysis) => {
                assert_eq!(analysis.summary, "mild");
                assert_eq!(analysis.key_findings, vec!["a"]);
            }
            SpecialistOutcome::Failed(message) => panic!("unexpected failure: {message}"),
        }
    }

    #[test]
    fn malformed_payload_embeds_raw_text_in_error() {
        let raw = "{\"keyFindings\": [";
        match parse_specialist_payload(Specialty::Radiologist, raw) {
            SpecialistOutcome::Failed(message) => {
                assert!(message.contains("Radiologist"));
                assert!(message.contains("{\"keyFindings\": ["));
            }
            SpecialistOutcome::Analysis(_) => panic!("expected a parse failure"),
        }
    }

    #[test]
    fn multibyte_character_split_across_chunks_decodes_intact() {
        let text = "caf\u{e9} au lait".as_bytes();
        // Split one byte into the two-byte sequence for e-acute.
        let split = text.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut raw = text[..split].to_vec();
        let first = take_complete_utf8(&mut raw);
        assert_eq!(first, "caf");
        assert_eq!(raw, [0xC3]);

        raw.extend_from_slice(&text[split..]);
        let rest = take_complete_utf8(&mut raw);
        assert_eq!(format!("{first}{rest}"), "café au lait");
        assert!(raw.is_empty());
    }

    #[test]
    fn sse_buffer_survives_chunk_splits() {
        let mut buffer = String::new();
        buffer.push_str("data: {\"candidates\":");
        assert!(drain_sse_data(&mut buffer).is_empty());

        buffer.push_str("[]}\n\ndata: [DONE]\n");
        let payloads = drain_sse_data(&mut buffer);
        assert_eq!(payloads, vec!["{\"candidates\":[]}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn stream_payload_text_is_extracted() {
        let payload = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"hel"},{"text":"lo"}]}}]}"#;
        let parsed: GenerateResponse = serde_json::from_str(payload).unwrap();
        assert_eq!(extract_text(&parsed).unwrap(), "hello");
    }

    #[test]
    fn empty_candidates_yield_no_text() {
        let parsed: GenerateResponse = serde_json::from_str("{}").unwrap();
        assert!(extract_text(&parsed).is_none());
    }

    #[test]
    fn generate_request_serializes_camel_case_wire_fields() {
        let request = GenerateRequest {
            contents: vec![Content::user(vec![
                Part::inline_image(&AttachedImage {
                    data: "aGVsbG8=".to_string(),
                    mime_type: "image/png".to_string(),
                }),
                Part::text("prompt"),
            ])],
            system_instruction: None,
            generation_config: Some(GenerationConfig {
                response_mime_type: "application/json".to_string(),
            }),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value["generationConfig"]["responseMimeType"],
            "application/json"
        );
        assert_eq!(
            value["contents"][0]["parts"][0]["inlineData"]["mimeType"],
            "image/png"
        );
        assert!(value.get("systemInstruction").is_none());
    }

    async fn read_http_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= header_end + 4 + content_length {
                return;
            }
        }
    }

    /// One-shot SSE endpoint: serves each connection in order, writing
    /// the body in the given pieces with a pause between writes so the
    /// client sees them as separate chunks.
    async fn spawn_sse_server(connections: Vec<(Duration, Vec<Vec<u8>>)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (initial_delay, body_pieces) in connections {
                let (mut socket, _) = listener.accept().await.unwrap();
                read_http_request(&mut socket).await;
                tokio::time::sleep(initial_delay).await;

                let body_len: usize = body_pieces.iter().map(Vec::len).sum();
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\n\
                     Content-Length: {body_len}\r\nConnection: close\r\n\r\n"
                );
                socket.write_all(header.as_bytes()).await.unwrap();
                for piece in body_pieces {
                    socket.write_all(&piece).await.unwrap();
                    socket.flush().await.unwrap();
                    tokio::time::sleep(Duration::from_millis(30)).await;
                }
            }
        });
        format!("http://{addr}")
    }

    fn sse_reply(text: &str) -> Vec<u8> {
        format!(
            "data: {}\n\n",
            serde_json::json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]
            })
        )
        .into_bytes()
    }

    async fn collect_reply(rx: &mut mpsc::Receiver<ChatEvent>) -> String {
        let mut text = String::new();
        while let Some(event) = rx.recv().await {
            match event {
                ChatEvent::Delta(chunk) => text.push_str(&chunk),
                ChatEvent::Done | ChatEvent::Error(_) => break,
            }
        }
        text
    }

    #[tokio::test]
    async fn streamed_reply_survives_multibyte_chunk_split() {
        let body = sse_reply("café");
        let split = body.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let base_url = spawn_sse_server(vec![(
            Duration::ZERO,
            vec![body[..split].to_vec(), body[split..].to_vec()],
        )])
        .await;

        let client = GeminiClient::with_base_url("test-key", base_url);
        let handle = client.open_chat("case context".to_string()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        handle.send("what does it say?", tx).await;
        assert_eq!(collect_reply(&mut rx).await, "café");

        let transcript = handle.transcript().await;
        assert_eq!(transcript.messages.last().unwrap().text, "café");
    }

    #[tokio::test]
    async fn concurrent_sends_keep_turns_atomic() {
        let base_url = spawn_sse_server(vec![
            (Duration::from_millis(150), vec![sse_reply("first reply")]),
            (Duration::ZERO, vec![sse_reply("second reply")]),
        ])
        .await;

        let client = GeminiClient::with_base_url("test-key", base_url);
        let handle: Arc<dyn ChatHandle> =
            Arc::from(client.open_chat("case context".to_string()).await.unwrap());

        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send("question one", tx1).await })
        };
        // Let the first send claim the session before the second starts.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.send("question two", tx2).await })
        };

        assert_eq!(collect_reply(&mut rx1).await, "first reply");
        assert_eq!(collect_reply(&mut rx2).await, "second reply");
        first.await.unwrap();
        second.await.unwrap();

        // Each user turn is immediately followed by its own reply; the
        // two streams never interleave into one message.
        let transcript = handle.transcript().await;
        let texts: Vec<_> = transcript.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(
            texts,
            vec![
                CHAT_GREETING,
                "question one",
                "first reply",
                "question two",
                "second reply",
            ]
        );
    }
}
