use bytes::{Buf, Bytes, BytesMut};
use futures_util::StreamExt;
use grelay_relay_core::{
    Meta, PartialUsage, RelayError, ResponseHead, ResponseWriter, UpstreamResponse, Usage,
    WriteError,
};
use http::header::{CACHE_CONTROL, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::tokens::count_text;

const DONE: &str = "[DONE]";

/// Splits an event stream into lines; a trailing partial line waits for the
/// next chunk.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line);
            lines.push(text.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        let text = String::from_utf8_lossy(rest.chunk());
        let text = text.trim_end_matches(['\r', '\n']);
        (!text.is_empty()).then(|| text.to_string())
    }
}

#[derive(Debug, Default)]
struct StreamState {
    done: bool,
    caller_gone: bool,
}

/// Records reported usage and completion text on the attempt as they pass.
fn observe(partial: &mut PartialUsage, event: &Value) {
    if let Some(usage) = event
        .get("usage")
        .filter(|usage| !usage.is_null())
        .and_then(|usage| serde_json::from_value::<Usage>(usage.clone()).ok())
    {
        partial.reported = Some(usage);
    }
    let Some(choices) = event.get("choices").and_then(Value::as_array) else {
        return;
    };
    for choice in choices {
        let text = choice
            .get("delta")
            .and_then(|delta| delta.get("content"))
            .or_else(|| choice.get("text"))
            .and_then(Value::as_str);
        if let Some(text) = text {
            partial.completion_text.push_str(text);
        }
    }
}

/// Relays an upstream event stream, rewriting the model name back to the one
/// the caller asked for. Once the caller is gone the rest is still read so the
/// usage at the end of the stream can be billed. What was seen before a
/// broken stream stays on `meta.partial`.
pub async fn relay_stream(
    meta: &mut Meta,
    writer: &mut dyn ResponseWriter,
    mut response: UpstreamResponse,
) -> Result<Option<Usage>, RelayError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    let mut state = StreamState::default();
    if let Err(err) = writer.write_head(ResponseHead::new(StatusCode::OK, headers)).await {
        caller_gone(meta, &mut state, err);
    }

    let mut parser = SseParser::new();
    while let Some(chunk) = response.body.next().await {
        let chunk = chunk.map_err(RelayError::request_failed)?;
        for line in parser.push_bytes(&chunk) {
            relay_line(meta, writer, &mut state, &line).await;
        }
    }
    if let Some(line) = parser.finish() {
        relay_line(meta, writer, &mut state, &line).await;
    }
    if !state.caller_gone {
        if let Err(err) = writer.write(Bytes::from_static(b"data: [DONE]\n\n")).await {
            caller_gone(meta, &mut state, err);
        }
    }

    debug!(
        event = "stream_done",
        request_id = %meta.request_id,
        upstream_done = state.done,
        reported_usage = meta.partial.reported.is_some()
    );
    if let Some(usage) = meta.partial.reported {
        return Ok(Some(usage));
    }
    if meta.partial.completion_text.is_empty() {
        return Ok(None);
    }
    let completion = count_text(&meta.actual_model, &meta.partial.completion_text);
    Ok(Some(Usage::new(meta.input_tokens, completion)))
}

async fn relay_line(
    meta: &mut Meta,
    writer: &mut dyn ResponseWriter,
    state: &mut StreamState,
    line: &str,
) {
    if line.is_empty() {
        return;
    }
    let out = match line.strip_prefix("data:") {
        Some(data) => {
            let data = data.trim();
            if data == DONE {
                state.done = true;
                return;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(mut event) => {
                    observe(&mut meta.partial, &event);
                    if let Some(model) = event.get_mut("model").filter(|model| model.is_string()) {
                        *model = Value::String(meta.origin_model.clone());
                    }
                    format!("data: {event}\n\n")
                }
                Err(_) => format!("data: {data}\n\n"),
            }
        }
        None => format!("{line}\n"),
    };
    if state.caller_gone {
        return;
    }
    if let Err(err) = writer.write(Bytes::from(out)).await {
        caller_gone(meta, state, err);
    }
}

fn caller_gone(meta: &Meta, state: &mut StreamState, err: WriteError) {
    if !state.caller_gone {
        warn!(
            event = "caller_gone",
            request_id = %meta.request_id,
            channel_id = meta.channel.id,
            error = %err
        );
    }
    state.caller_gone = true;
}
