use http::StatusCode;
use serde_json::Value;

use crate::detail::truncate_text;
use crate::error::RelayError;

const RAW_MESSAGE_LIMIT: usize = 1024;

#[derive(Debug, Default, PartialEq, Eq)]
struct VendorError {
    message: String,
    error_type: Option<String>,
    code: Option<String>,
    param: Option<String>,
}

/// Builds the caller-facing error for a non-success upstream response.
///
/// Shapes are tried in order: `{"error":{...}}`, a flat
/// `{"message","type","code"}` object, an array of either, then the raw body.
pub fn parse_upstream_error(status: StatusCode, body: &[u8]) -> RelayError {
    let status_code = status.as_u16();
    if let Some(vendor) = serde_json::from_slice::<Value>(body)
        .ok()
        .as_ref()
        .and_then(vendor_error)
    {
        let message = if vendor.message.is_empty() {
            fallback_message(status)
        } else {
            vendor.message
        };
        return RelayError::upstream(
            status_code,
            vendor.error_type,
            vendor.code,
            message,
            vendor.param,
        );
    }

    let raw = String::from_utf8_lossy(body);
    let raw = raw.trim();
    let message = if raw.is_empty() {
        fallback_message(status)
    } else {
        truncate_text(raw, RAW_MESSAGE_LIMIT).0
    };
    RelayError::upstream(status_code, None, None, message, None)
}

fn fallback_message(status: StatusCode) -> String {
    format!("bad response status code {}", status.as_u16())
}

fn vendor_error(value: &Value) -> Option<VendorError> {
    match value {
        Value::Object(map) => match map.get("error") {
            Some(inner @ Value::Object(_)) => from_object(inner),
            Some(Value::String(message)) if !message.is_empty() => Some(VendorError {
                message: message.clone(),
                error_type: text(map.get("type")),
                code: text(map.get("code")),
                param: None,
            }),
            _ => from_object(value),
        },
        Value::Array(items) => items.first().and_then(vendor_error),
        _ => None,
    }
}

fn from_object(value: &Value) -> Option<VendorError> {
    let message = text(value.get("message")).unwrap_or_default();
    let error_type = text(value.get("type"));
    let code = text(value.get("code"));
    if message.is_empty() && error_type.is_none() && code.is_none() {
        return None;
    }
    Some(VendorError {
        message,
        error_type,
        code,
        param: text(value.get("param")),
    })
}

/// Vendors send codes as strings or numbers.
fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(value) if !value.is_empty() => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        _ => None,
    }
}
