use axum::extract::{FromRequest, Multipart, Request};
use bytes::Bytes;
use grelay_relay_core::{FormPart, RelayError};
use http::header::CONTENT_TYPE;
use http::StatusCode;
use serde_json::Value;

/// The parts of a caller request the relay needs before picking a channel.
#[derive(Debug, Clone, Default)]
pub struct ParsedRequest {
    pub model: String,
    pub body: Bytes,
    pub form: Vec<FormPart>,
}

fn is_multipart(request: &Request) -> bool {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"))
}

/// Reads the body and finds the requested model, in the JSON `model` field
/// or the multipart `model` part. The body limit set on the router applies.
pub async fn parse_request(request: Request) -> Result<ParsedRequest, RelayError> {
    let engine = engine_model(request.uri().path()).map(str::to_string);
    let mut parsed = if is_multipart(&request) {
        parse_form(request).await?
    } else {
        parse_json(request).await?
    };
    if parsed.model.is_empty() {
        parsed.model = engine.unwrap_or_default();
    }
    if parsed.model.is_empty() {
        return Err(RelayError::bad_request("model_required", "model is required"));
    }
    Ok(parsed)
}

async fn parse_json(request: Request) -> Result<ParsedRequest, RelayError> {
    let body = Bytes::from_request(request, &())
        .await
        .map_err(|rejection| body_error(rejection.status(), rejection.body_text()))?;
    if body.is_empty() {
        return Err(RelayError::invalid_request("request body is empty"));
    }
    let value: Value = serde_json::from_slice(&body)
        .map_err(|err| RelayError::invalid_request(format!("invalid json body: {err}")))?;
    let model = match value.get("model") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(model)) => model.trim().to_string(),
        Some(_) => return Err(RelayError::invalid_request("model must be a string")),
    };
    Ok(ParsedRequest {
        model,
        body,
        form: Vec::new(),
    })
}

async fn parse_form(request: Request) -> Result<ParsedRequest, RelayError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|rejection| body_error(rejection.status(), rejection.body_text()))?;
    let mut form = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| body_error(err.status(), err.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|err| body_error(err.status(), err.body_text()))?;
        form.push(FormPart {
            name,
            file_name,
            content_type,
            data,
        });
    }
    let model = form
        .iter()
        .find(|part| part.name == "model" && !part.is_file())
        .map(|part| String::from_utf8_lossy(&part.data).trim().to_string())
        .unwrap_or_default();
    Ok(ParsedRequest {
        model,
        body: Bytes::new(),
        form,
    })
}

fn body_error(status: StatusCode, message: String) -> RelayError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return RelayError::local(status, "request_too_large", message);
    }
    RelayError::invalid_request(message)
}

/// `/v1/engines/{model}/embeddings` names the model in the path.
fn engine_model(path: &str) -> Option<&str> {
    path.strip_prefix("/v1/engines/")?
        .strip_suffix("/embeddings")
        .filter(|model| !model.is_empty() && !model.contains('/'))
}
