use grelay_relay_core::{
    BillingPrice, CallerRequest, Meta, PricingCatalog, RelayError, RelayMode,
};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::tokens::{count_input, count_messages, count_text};

pub const DEFAULT_IMAGE_SIZE: &str = "1024x1024";
pub const MAX_IMAGE_COUNT: u64 = 10;

/// Inputs of the admission estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreCheckBalanceRequest {
    pub input_tokens: u64,
    pub max_tokens: Option<u64>,
    pub input_price: Decimal,
    pub output_price: Decimal,
    pub price_unit: Decimal,
}

impl PreCheckBalanceRequest {
    fn new(input_tokens: u64, max_tokens: Option<u64>, price: BillingPrice) -> Self {
        Self {
            input_tokens,
            max_tokens,
            input_price: price.input_price,
            output_price: price.output_price,
            price_unit: price.price_unit,
        }
    }
}

/// Validates the caller body for `meta.mode` and estimates its input size.
/// Per-image and per-character modes replace `meta.billing_price`; the
/// estimate is stored in `meta.input_tokens`.
pub fn pre_check(
    meta: &mut Meta,
    caller: &CallerRequest,
    pricing: &dyn PricingCatalog,
) -> Result<PreCheckBalanceRequest, RelayError> {
    let model = meta.actual_model.clone();
    let (input_tokens, max_tokens) = match meta.mode {
        RelayMode::ChatCompletions => {
            let body = json_body(caller)?;
            let messages = body
                .get("messages")
                .and_then(Value::as_array)
                .filter(|messages| !messages.is_empty())
                .ok_or_else(|| RelayError::invalid_request("field messages is required"))?;
            let max_tokens = u64_field(&body, "max_completion_tokens")
                .or_else(|| u64_field(&body, "max_tokens"));
            (count_messages(&model, messages), max_tokens)
        }
        RelayMode::Completions => {
            let body = json_body(caller)?;
            let prompt = required(&body, "prompt")?;
            (count_input(&model, prompt), u64_field(&body, "max_tokens"))
        }
        RelayMode::Embeddings | RelayMode::Moderations => {
            let body = json_body(caller)?;
            let input = required(&body, "input")?;
            (count_input(&model, input), None)
        }
        RelayMode::ImagesGenerations => {
            let body = json_body(caller)?;
            let prompt = body.get("prompt").and_then(Value::as_str).unwrap_or("");
            let n = u64_field(&body, "n");
            let size = body.get("size").and_then(Value::as_str);
            image_estimate(meta, pricing, prompt, n, size)?
        }
        RelayMode::Edits => {
            if !caller.has_file("image") {
                return Err(RelayError::invalid_request("field image is required"));
            }
            let prompt = caller.form_value("prompt").unwrap_or("").to_string();
            let n = match caller.form_value("n") {
                Some(raw) => Some(raw.trim().parse::<u64>().map_err(|_| {
                    RelayError::invalid_request("field n must be an integer")
                })?),
                None => None,
            };
            let size = caller.form_value("size").map(str::to_string);
            image_estimate(meta, pricing, &prompt, n, size.as_deref())?
        }
        RelayMode::AudioSpeech => {
            let body = json_body(caller)?;
            let input = body
                .get("input")
                .and_then(Value::as_str)
                .filter(|input| !input.is_empty())
                .ok_or_else(|| RelayError::invalid_request("field input is required"))?;
            meta.billing_price = BillingPrice::per_item(meta.price.input_price);
            (input.chars().count() as u64, None)
        }
        RelayMode::AudioTranscription | RelayMode::AudioTranslation | RelayMode::ParsePdf => {
            if !caller.has_file("file") {
                return Err(RelayError::invalid_request("field file is required"));
            }
            (0, None)
        }
        RelayMode::Rerank => {
            let body = json_body(caller)?;
            let query = body
                .get("query")
                .and_then(Value::as_str)
                .filter(|query| !query.is_empty())
                .ok_or_else(|| RelayError::invalid_request("field query is required"))?;
            let documents = body
                .get("documents")
                .and_then(Value::as_array)
                .filter(|documents| !documents.is_empty())
                .ok_or_else(|| RelayError::invalid_request("field documents is required"))?;
            let documents: u64 = documents
                .iter()
                .map(|document| match document {
                    Value::String(text) => count_text(&model, text),
                    other => other
                        .get("text")
                        .and_then(Value::as_str)
                        .map(|text| count_text(&model, text))
                        .unwrap_or(0),
                })
                .sum();
            (count_text(&model, query) + documents, None)
        }
    };

    meta.input_tokens = input_tokens;
    Ok(PreCheckBalanceRequest::new(
        input_tokens,
        max_tokens,
        meta.billing_price,
    ))
}

fn image_estimate(
    meta: &mut Meta,
    pricing: &dyn PricingCatalog,
    prompt: &str,
    n: Option<u64>,
    size: Option<&str>,
) -> Result<(u64, Option<u64>), RelayError> {
    if prompt.is_empty() {
        return Err(RelayError::invalid_request("field prompt is required"));
    }
    let n = n.unwrap_or(1);
    if !(1..=MAX_IMAGE_COUNT).contains(&n) {
        return Err(RelayError::invalid_request(format!(
            "field n must be between 1 and {MAX_IMAGE_COUNT}"
        )));
    }
    let size = size.filter(|size| !size.is_empty()).unwrap_or(DEFAULT_IMAGE_SIZE);
    let price = pricing
        .image_size_price(&meta.actual_model, size)
        .or_else(|| pricing.image_size_price(&meta.origin_model, size))
        .or_else(|| meta.price.image_prices.get(size).copied())
        .ok_or_else(|| {
            RelayError::bad_request("invalid_image_size", format!("invalid image size: {size}"))
        })?;
    meta.billing_price = BillingPrice::per_item(price);
    Ok((n, None))
}

fn json_body(caller: &CallerRequest) -> Result<Value, RelayError> {
    let value: Value = serde_json::from_slice(&caller.body)
        .map_err(|err| RelayError::invalid_request(format!("invalid request body: {err}")))?;
    if !value.is_object() {
        return Err(RelayError::invalid_request("request body must be a JSON object"));
    }
    Ok(value)
}

fn required<'a>(body: &'a Value, field: &str) -> Result<&'a Value, RelayError> {
    match body.get(field) {
        None | Some(Value::Null) => Err(RelayError::invalid_request(format!(
            "field {field} is required"
        ))),
        Some(Value::String(text)) if text.is_empty() => Err(RelayError::invalid_request(
            format!("field {field} is required"),
        )),
        Some(value) => Ok(value),
    }
}

fn u64_field(body: &Value, field: &str) -> Option<u64> {
    body.get(field).and_then(Value::as_u64).filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::Arc;

    use bytes::Bytes;
    use grelay_relay_core::{
        Channel, ChannelConfig, ChannelType, FormPart, MemoryPricing, ModelPrice,
    };
    use http::{HeaderMap, Method};
    use serde_json::json;

    use super::*;

    fn channel() -> Arc<Channel> {
        Arc::new(Channel {
            id: 1,
            kind: ChannelType::OpenAI,
            name: "c1".to_string(),
            base_url: String::new(),
            key: "sk".to_string(),
            models: vec!["gpt-3.5-turbo".to_string(), "dall-e-3".to_string()],
            model_mapping: HashMap::new(),
            priority: 0,
            enabled: true,
            config: ChannelConfig::default(),
        })
    }

    fn meta(mode: RelayMode, model: &str, price: ModelPrice) -> Meta {
        Meta::builder(channel(), mode, model).price(price).build()
    }

    fn caller(body: Value) -> CallerRequest {
        CallerRequest::new(
            Method::POST,
            "/v1/test",
            HeaderMap::new(),
            Bytes::from(body.to_string()),
        )
    }

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    #[test]
    fn chat_prefers_max_completion_tokens() {
        let price = ModelPrice {
            input_price: dec("0.02"),
            output_price: dec("0.04"),
            ..ModelPrice::default()
        };
        let mut meta = meta(RelayMode::ChatCompletions, "gpt-3.5-turbo", price);
        let request = caller(json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 10,
            "max_completion_tokens": 50
        }));
        let check = pre_check(&mut meta, &request, &MemoryPricing::default()).unwrap();
        assert_eq!(check.max_tokens, Some(50));
        assert!(check.input_tokens > 0);
        assert_eq!(meta.input_tokens, check.input_tokens);
        assert_eq!(check.input_price, dec("0.02"));
        assert_eq!(check.price_unit, Decimal::ONE_THOUSAND);
    }

    #[test]
    fn chat_without_messages_is_rejected() {
        let mut meta = meta(RelayMode::ChatCompletions, "gpt-3.5-turbo", ModelPrice::default());
        let err = pre_check(&mut meta, &caller(json!({"messages": []})), &MemoryPricing::default())
            .unwrap_err();
        assert_eq!(err.status, http::StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "field messages is required");
    }

    #[test]
    fn images_bill_per_image_at_size_price() {
        let price = ModelPrice {
            image_prices: HashMap::from([("1024x1024".to_string(), dec("0.04"))]),
            ..ModelPrice::default()
        };
        let pricing = MemoryPricing::default().with_price("dall-e-3", price.clone());
        let mut meta = meta(RelayMode::ImagesGenerations, "dall-e-3", price);
        let check = pre_check(
            &mut meta,
            &caller(json!({"prompt": "a cat", "n": 2})),
            &pricing,
        )
        .unwrap();
        assert_eq!(check.input_tokens, 2);
        assert_eq!(check.input_price, dec("0.04"));
        assert_eq!(check.price_unit, Decimal::ONE);
        assert_eq!(meta.billing_price, BillingPrice::per_item(dec("0.04")));
    }

    #[test]
    fn images_reject_unknown_size_and_count() {
        let mut meta = meta(RelayMode::ImagesGenerations, "dall-e-3", ModelPrice::default());
        let pricing = MemoryPricing::default();
        let err = pre_check(
            &mut meta,
            &caller(json!({"prompt": "a cat", "size": "3x3"})),
            &pricing,
        )
        .unwrap_err();
        assert_eq!(err.code, "invalid_image_size");

        let err = pre_check(&mut meta, &caller(json!({"prompt": "a cat", "n": 11})), &pricing)
            .unwrap_err();
        assert_eq!(err.message, "field n must be between 1 and 10");
    }

    #[test]
    fn image_edits_read_form_fields() {
        let price = ModelPrice {
            image_prices: HashMap::from([("512x512".to_string(), dec("0.018"))]),
            ..ModelPrice::default()
        };
        let mut meta = meta(RelayMode::Edits, "dall-e-3", price);
        let image = FormPart {
            name: "image".to_string(),
            file_name: Some("in.png".to_string()),
            content_type: Some("image/png".to_string()),
            data: Bytes::from_static(b"\x89PNG"),
        };
        let request = caller(json!({})).with_form(vec![
            image,
            FormPart::text("prompt", "add a hat"),
            FormPart::text("n", "3"),
            FormPart::text("size", "512x512"),
        ]);
        let check = pre_check(&mut meta, &request, &MemoryPricing::default()).unwrap();
        assert_eq!(check.input_tokens, 3);
        assert_eq!(check.input_price, dec("0.018"));
    }

    #[test]
    fn speech_counts_characters() {
        let price = ModelPrice {
            input_price: dec("0.000015"),
            ..ModelPrice::default()
        };
        let mut meta = meta(RelayMode::AudioSpeech, "tts-1", price);
        let check = pre_check(
            &mut meta,
            &caller(json!({"input": "héllo", "voice": "alloy"})),
            &MemoryPricing::default(),
        )
        .unwrap();
        assert_eq!(check.input_tokens, 5);
        assert_eq!(check.price_unit, Decimal::ONE);
    }

    #[test]
    fn transcription_requires_a_file() {
        let mut meta = meta(RelayMode::AudioTranscription, "whisper-1", ModelPrice::default());
        let err = pre_check(&mut meta, &caller(json!({})), &MemoryPricing::default()).unwrap_err();
        assert_eq!(err.message, "field file is required");
    }

    #[test]
    fn rerank_counts_query_and_documents() {
        let mut meta = meta(RelayMode::Rerank, "rerank-1", ModelPrice::default());
        let check = pre_check(
            &mut meta,
            &caller(json!({"query": "rust", "documents": ["a", {"text": "b"}]})),
            &MemoryPricing::default(),
        )
        .unwrap();
        assert!(check.input_tokens >= 3);
    }
}
