use std::sync::OnceLock;

use serde_json::Value;
use tiktoken_rs::CoreBPE;
use tracing::warn;

const TOKENS_PER_MESSAGE: u64 = 3;
const TOKENS_PER_NAME: u64 = 1;
const REPLY_PRIMING_TOKENS: u64 = 3;
/// Flat charge for an image part, the low-detail tile cost.
const IMAGE_PART_TOKENS: u64 = 85;

static CL100K: OnceLock<Option<CoreBPE>> = OnceLock::new();
static O200K: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn encoder(model: &str) -> Option<&'static CoreBPE> {
    let uses_o200k = ["gpt-4o", "gpt-4.1", "gpt-5", "o1", "o3", "o4", "chatgpt-4o"]
        .iter()
        .any(|prefix| model.starts_with(prefix));
    let slot = if uses_o200k { &O200K } else { &CL100K };
    slot.get_or_init(|| {
        let loaded = if uses_o200k {
            tiktoken_rs::o200k_base()
        } else {
            tiktoken_rs::cl100k_base()
        };
        match loaded {
            Ok(bpe) => Some(bpe),
            Err(err) => {
                warn!(event = "tokenizer_unavailable", error = %err);
                None
            }
        }
    })
    .as_ref()
}

/// Token estimate of `text` for `model`. Falls back to a 4-bytes-per-token
/// guess when no encoder can be loaded.
pub fn count_text(model: &str, text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match encoder(model) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
        None => (text.len() as u64).div_ceil(4),
    }
}

/// Chat prompt estimate following the per-message framing of chat models.
pub fn count_messages(model: &str, messages: &[Value]) -> u64 {
    let mut total = 0;
    for message in messages {
        total += TOKENS_PER_MESSAGE;
        if let Some(role) = message.get("role").and_then(Value::as_str) {
            total += count_text(model, role);
        }
        if let Some(name) = message.get("name").and_then(Value::as_str) {
            total += count_text(model, name) + TOKENS_PER_NAME;
        }
        if let Some(content) = message.get("content") {
            total += count_content(model, content);
        }
    }
    total + REPLY_PRIMING_TOKENS
}

fn count_content(model: &str, content: &Value) -> u64 {
    match content {
        Value::String(text) => count_text(model, text),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part.get("type").and_then(Value::as_str) {
                Some("text") => part
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|text| count_text(model, text))
                    .unwrap_or(0),
                Some("image_url") => IMAGE_PART_TOKENS,
                _ => 0,
            })
            .sum(),
        _ => 0,
    }
}

/// Counts a string, an array of strings, or an array of token arrays.
pub fn count_input(model: &str, input: &Value) -> u64 {
    match input {
        Value::String(text) => count_text(model, text),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => count_text(model, text),
                Value::Number(_) => 1,
                Value::Array(tokens) => tokens.len() as u64,
                _ => 0,
            })
            .sum(),
        _ => 0,
    }
}
