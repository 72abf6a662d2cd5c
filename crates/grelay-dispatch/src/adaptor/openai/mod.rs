mod form;
mod oauth;
mod stream;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use grelay_relay_core::{
    Adaptor, CallerRequest, ConvertedRequest, FormPart, Meta, ModelConfig, ModelPrice, OutboundRequest,
    RelayError, RelayMode, ResponseHead, ResponseWriter, UpstreamResponse, Usage,
    parse_upstream_error,
};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use tracing::warn;

use crate::client;
use crate::tokens::count_text;

pub use oauth::{ClientCredentialsExchanger, OpenAIOAuthAdaptor};
pub use stream::SseParser;

pub const CHANNEL_NAME: &str = "openai";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

const STREAM_KEY: &str = "stream";

pub fn mode_path(mode: RelayMode) -> Option<&'static str> {
    let path = match mode {
        RelayMode::ChatCompletions => "/v1/chat/completions",
        RelayMode::Completions => "/v1/completions",
        RelayMode::Embeddings => "/v1/embeddings",
        RelayMode::Moderations => "/v1/moderations",
        RelayMode::ImagesGenerations => "/v1/images/generations",
        RelayMode::Edits => "/v1/images/edits",
        RelayMode::AudioSpeech => "/v1/audio/speech",
        RelayMode::AudioTranscription => "/v1/audio/transcriptions",
        RelayMode::AudioTranslation => "/v1/audio/translations",
        RelayMode::Rerank => "/v1/rerank",
        RelayMode::ParsePdf => return None,
    };
    Some(path)
}

/// `base` joined with the mode path; a base already ending in `/v1` is not
/// doubled.
pub fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    match base.strip_suffix("/v1") {
        Some(root) => format!("{root}{path}"),
        None => format!("{base}{path}"),
    }
}

/// Rewrites the caller body for the upstream: actual model name and, for
/// streamed text completions, a request for the trailing usage event.
pub fn convert_body(meta: &mut Meta, caller: &CallerRequest) -> Result<ConvertedRequest, RelayError> {
    let mut headers = HeaderMap::new();
    if meta.mode.is_multipart() || !caller.form.is_empty() {
        meta.set(form::FORM_KEY, form::with_model(&caller.form, &meta.actual_model));
        return Ok(ConvertedRequest {
            method: caller.method.clone(),
            headers,
            body: Bytes::new(),
        });
    }

    let mut body: Map<String, Value> = serde_json::from_slice(&caller.body)
        .map_err(|err| RelayError::invalid_request(format!("invalid request body: {err}")))?;
    body.insert("model".to_string(), Value::String(meta.actual_model.clone()));
    let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    if streaming && matches!(meta.mode, RelayMode::ChatCompletions | RelayMode::Completions) {
        let options = body
            .entry("stream_options")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(options) = options.as_object_mut() {
            options.insert("include_usage".to_string(), Value::Bool(true));
        }
    }
    meta.set(STREAM_KEY, streaming);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let body = serde_json::to_vec(&body)
        .map_err(|err| RelayError::internal("encode_request_failed", err.to_string()))?;
    Ok(ConvertedRequest {
        method: caller.method.clone(),
        headers,
        body: Bytes::from(body),
    })
}

pub fn bearer(token: &str) -> Result<HeaderValue, RelayError> {
    let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| RelayError::internal("invalid_channel_key", "channel key is not a valid header value"))?;
    value.set_sensitive(true);
    Ok(value)
}

/// Uploads the stashed form for multipart modes, the converted body otherwise.
pub async fn send_request(
    meta: &mut Meta,
    outbound: &OutboundRequest,
) -> Result<UpstreamResponse, RelayError> {
    match meta.take::<Vec<FormPart>>(form::FORM_KEY) {
        Some(parts) => client::send_multipart(meta, outbound, form::build(parts)?).await,
        None => client::send(meta, outbound).await,
    }
}

/// Relays a finished upstream response and reads the usage it reports.
pub async fn relay_response(
    meta: &mut Meta,
    writer: &mut dyn ResponseWriter,
    response: UpstreamResponse,
) -> Result<Option<Usage>, RelayError> {
    if response.is_event_stream() {
        return stream::relay_stream(meta, writer, response).await;
    }
    let is_json = response.content_type().contains("json");
    if !is_json {
        return relay_raw(meta, writer, response).await;
    }

    let status = response.status;
    let headers = json_headers();
    let body = response
        .collect()
        .await
        .map_err(RelayError::request_failed)?;
    let Ok(mut value) = serde_json::from_slice::<Value>(&body) else {
        write_all(meta, writer, ResponseHead::new(status, headers), body).await;
        return Ok(None);
    };
    if value.get("error").is_some_and(|error| !error.is_null()) {
        return Err(parse_upstream_error(StatusCode::INTERNAL_SERVER_ERROR, &body));
    }

    let usage = usage_of(meta, &value);
    let body = match value.get_mut("model").filter(|model| model.is_string()) {
        Some(model) => {
            *model = Value::String(meta.origin_model.clone());
            serde_json::to_vec(&value)
                .map(Bytes::from)
                .unwrap_or(body)
        }
        None => body,
    };
    write_all(meta, writer, ResponseHead::new(status, headers), body).await;
    Ok(usage)
}

fn usage_of(meta: &Meta, value: &Value) -> Option<Usage> {
    if let Some(usage) = value
        .get("usage")
        .filter(|usage| usage.is_object())
        .and_then(|usage| serde_json::from_value::<Usage>(usage.clone()).ok())
    {
        return Some(usage);
    }
    match meta.mode {
        RelayMode::ImagesGenerations => value
            .get("data")
            .and_then(Value::as_array)
            .map(|data| Usage::new(data.len() as u64, 0)),
        RelayMode::AudioTranscription | RelayMode::AudioTranslation => value
            .get("text")
            .and_then(Value::as_str)
            .map(|text| Usage::new(meta.input_tokens, count_text(&meta.actual_model, text))),
        _ => None,
    }
}

/// Audio and plain-text bodies go through untouched.
async fn relay_raw(
    meta: &Meta,
    writer: &mut dyn ResponseWriter,
    mut response: UpstreamResponse,
) -> Result<Option<Usage>, RelayError> {
    let mut headers = HeaderMap::new();
    if let Some(content_type) = response.headers.get(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, content_type.clone());
    }
    let transcribing = matches!(
        meta.mode,
        RelayMode::AudioTranscription | RelayMode::AudioTranslation
    );
    let mut text = Vec::new();
    let mut caller_gone = writer
        .write_head(ResponseHead::new(response.status, headers))
        .await
        .is_err();
    while let Some(chunk) = response.body.next().await {
        let chunk = chunk.map_err(RelayError::request_failed)?;
        if transcribing {
            text.extend_from_slice(&chunk);
        }
        if caller_gone {
            continue;
        }
        if let Err(err) = writer.write(chunk).await {
            warn!(event = "caller_gone", request_id = %meta.request_id, error = %err);
            caller_gone = true;
        }
    }
    if !transcribing {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&text);
    Ok(Some(Usage::new(
        meta.input_tokens,
        count_text(&meta.actual_model, &text),
    )))
}

async fn write_all(meta: &Meta, writer: &mut dyn ResponseWriter, head: ResponseHead, body: Bytes) {
    let result = match writer.write_head(head).await {
        Ok(()) => writer.write(body).await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        warn!(event = "caller_gone", request_id = %meta.request_id, error = %err);
    }
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

pub fn request_url(meta: &Meta, default_base: &str, channel: &str) -> Result<String, RelayError> {
    let path = mode_path(meta.mode).ok_or_else(|| RelayError::unsupported_mode(meta.mode, channel))?;
    Ok(join_url(meta.base_url().unwrap_or(default_base), path))
}

pub fn default_models() -> Vec<ModelConfig> {
    let per_thousand = |input: &str, output: &str| ModelPrice {
        input_price: input.parse().unwrap_or(Decimal::ZERO),
        output_price: output.parse().unwrap_or(Decimal::ZERO),
        price_unit: Decimal::ONE_THOUSAND,
        ..ModelPrice::default()
    };
    [
        ("gpt-4o", per_thousand("0.0025", "0.01")),
        ("gpt-4o-mini", per_thousand("0.00015", "0.0006")),
        ("gpt-3.5-turbo", per_thousand("0.0005", "0.0015")),
        ("text-embedding-3-small", per_thousand("0.00002", "0")),
        ("whisper-1", per_thousand("0.006", "0")),
        ("tts-1", per_thousand("0.015", "0")),
    ]
    .into_iter()
    .map(|(model, price)| ModelConfig {
        model: model.to_string(),
        owned_by: CHANNEL_NAME.to_string(),
        price,
    })
    .collect()
}

/// OpenAI and OpenAI-compatible endpoints keyed by a static API key.
#[derive(Debug, Default)]
pub struct OpenAIAdaptor;

#[async_trait]
impl Adaptor for OpenAIAdaptor {
    fn channel_name(&self) -> &'static str {
        CHANNEL_NAME
    }

    fn base_url(&self) -> &'static str {
        DEFAULT_BASE_URL
    }

    fn request_url(&self, meta: &Meta) -> Result<String, RelayError> {
        request_url(meta, DEFAULT_BASE_URL, CHANNEL_NAME)
    }

    async fn convert_request(
        &self,
        meta: &mut Meta,
        caller: &CallerRequest,
    ) -> Result<ConvertedRequest, RelayError> {
        convert_body(meta, caller)
    }

    async fn setup_request_header(
        &self,
        meta: &Meta,
        _caller: &CallerRequest,
        outbound: &mut OutboundRequest,
    ) -> Result<(), RelayError> {
        outbound.headers.insert(AUTHORIZATION, bearer(&meta.channel.key)?);
        Ok(())
    }

    async fn do_request(
        &self,
        meta: &mut Meta,
        _caller: &CallerRequest,
        outbound: &OutboundRequest,
    ) -> Result<UpstreamResponse, RelayError> {
        send_request(meta, outbound).await
    }

    async fn do_response(
        &self,
        meta: &mut Meta,
        writer: &mut dyn ResponseWriter,
        response: UpstreamResponse,
    ) -> Result<Option<Usage>, RelayError> {
        relay_response(meta, writer, response).await
    }

    fn model_list(&self) -> Vec<ModelConfig> {
        default_models()
    }
}
