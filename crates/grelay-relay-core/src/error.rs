use bytes::Bytes;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mode::RelayMode;

pub const LOCAL_ERROR_TYPE: &str = "grelay_error";
pub const UPSTREAM_ERROR_TYPE: &str = "upstream_error";
pub const BAD_RESPONSE_CODE: &str = "bad_response_status_code";

/// Status used for callers that went away before the attempt finished.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Raised by the gateway itself: validation, admission, transport.
    Local,
    /// Parsed from a vendor error body.
    Upstream,
}

#[derive(Debug, Clone, Error)]
#[error("{message} (code: {code}, status: {status})")]
pub struct RelayError {
    pub kind: ErrorKind,
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorObject<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorObject<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    error_type: &'a str,
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    param: Option<&'a str>,
}

impl RelayError {
    pub fn local(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Local,
            status,
            code: code.into(),
            message: message.into(),
            error_type: LOCAL_ERROR_TYPE.to_string(),
            param: None,
        }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::local(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::bad_request("invalid_request", message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::local(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn insufficient_balance() -> Self {
        Self::local(
            StatusCode::FORBIDDEN,
            "insufficient_group_balance",
            "group balance is not enough",
        )
    }

    pub fn get_balance_failed(reason: impl std::fmt::Display) -> Self {
        Self::internal("get_balance_failed", format!("get group balance failed: {reason}"))
    }

    pub fn price_not_found(model: &str) -> Self {
        Self::bad_request(
            "model_price_not_found",
            format!("model price not found: {model}"),
        )
    }

    pub fn adaptor_not_found(channel_type: impl std::fmt::Display) -> Self {
        Self::bad_request(
            "invalid_channel_type",
            format!("no adaptor registered for channel type {channel_type}"),
        )
    }

    pub fn unsupported_mode(mode: RelayMode, channel: &str) -> Self {
        Self::local(
            StatusCode::NOT_IMPLEMENTED,
            "unsupported_relay_mode",
            format!("relay mode {mode} is not supported by {channel}"),
        )
    }

    pub fn upstream_timeout() -> Self {
        Self::local(
            StatusCode::GATEWAY_TIMEOUT,
            "upstream_timeout",
            "upstream did not respond within the timeout budget",
        )
    }

    pub fn request_failed(reason: impl std::fmt::Display) -> Self {
        Self::local(
            StatusCode::BAD_GATEWAY,
            "request_failed",
            format!("upstream request failed: {reason}"),
        )
    }

    pub fn client_canceled() -> Self {
        let status = StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
            .unwrap_or(StatusCode::BAD_REQUEST);
        Self::local(status, "client_canceled", "client closed the request")
    }

    pub fn upstream_load_saturated() -> Self {
        Self::local(
            StatusCode::SERVICE_UNAVAILABLE,
            "upstream_load_saturated",
            "the upstream load is saturated, please try again later",
        )
    }

    /// Error reported by a vendor. Unparseable statuses become 502.
    pub fn upstream(
        status: u16,
        error_type: Option<String>,
        code: Option<String>,
        message: impl Into<String>,
        param: Option<String>,
    ) -> Self {
        let parsed = error_type.is_some() || code.is_some();
        let error_type = error_type
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| UPSTREAM_ERROR_TYPE.to_string());
        let code = code
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| BAD_RESPONSE_CODE.to_string());
        let param = match param {
            Some(param) => Some(param),
            None if !parsed => Some(status.to_string()),
            None => None,
        };
        Self {
            kind: ErrorKind::Upstream,
            status: sane_upstream_status(status),
            code,
            message: message.into(),
            error_type,
            param,
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind == ErrorKind::Local
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        if !request_id.is_empty() && !self.message.contains(request_id) {
            self.message = format!("{} (request id: {request_id})", self.message);
        }
        self
    }

    pub fn to_json(&self) -> Bytes {
        let envelope = ErrorEnvelope {
            error: ErrorObject {
                message: &self.message,
                error_type: &self.error_type,
                code: &self.code,
                param: self.param.as_deref(),
            },
        };
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .unwrap_or_else(|_| Bytes::from_static(b"{\"error\":{}}"))
    }
}

pub fn sane_upstream_status(status: u16) -> StatusCode {
    match StatusCode::from_u16(status) {
        Ok(code) if (400..=599).contains(&status) => code,
        _ => StatusCode::BAD_GATEWAY,
    }
}
