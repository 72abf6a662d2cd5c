use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream;
use grelay_dispatch::RelayRequest;
use grelay_relay_core::{CallerRequest, RelayError, RelayMode, response_channel};
use http::header::CONTENT_TYPE;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::AuthError;
use crate::core::CoreState;
use crate::request::parse_request;

const REQUEST_ID: &str = "x-request-id";

pub async fn relay_handler(State(state): State<Arc<CoreState>>, request: Request) -> Response {
    let request_id = request_id(request.headers());
    let path = request.uri().path().to_string();
    let Some(mode) = RelayMode::from_path(&path) else {
        let err = RelayError::local(StatusCode::NOT_FOUND, "unknown_endpoint", "unknown endpoint");
        return error_response(&request_id, err);
    };

    let auth_ctx = match state.auth.authenticate(request.headers()) {
        Ok(ctx) => ctx,
        Err(err) => return auth_error_response(&request_id, err),
    };

    let method = request.method().clone();
    let headers = request.headers().clone();
    let parsed = match parse_request(request).await {
        Ok(parsed) => parsed,
        Err(err) => return error_response(&request_id, err),
    };

    let caller = CallerRequest::new(method, path, headers, parsed.body).with_form(parsed.form);
    let relay_request = RelayRequest {
        request_id: request_id.clone(),
        request_at: OffsetDateTime::now_utc(),
        group: auth_ctx.group,
        token_id: auth_ctx.token_id,
        token_name: auth_ctx.token_name,
        mode,
        model: parsed.model,
        caller,
    };
    info!(
        event = "relay_request",
        request_id = %request_id,
        mode = mode.as_str(),
        model = %relay_request.model,
        group = %relay_request.group
    );

    // The relay owns the writer on its own tracked task so billing still
    // runs when the caller disconnects mid-stream.
    let buffer = state.relay.pipeline().config().caller_buffer;
    let (mut writer, receiver) = response_channel(buffer);
    let relay = state.relay.clone();
    state.relays.spawn(async move {
        let request_id = relay_request.request_id.clone();
        if let Err(err) = relay.relay(relay_request, &mut writer).await {
            debug!(event = "relay_finished_with_error", request_id = %request_id, code = %err.code);
        }
    });

    let Ok(head) = receiver.head.await else {
        let err = RelayError::internal("relay_aborted", "relay ended without a response");
        return error_response(&request_id, err);
    };
    let body = stream::unfold(receiver.body, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<Bytes, Infallible>(chunk), rx))
    });
    let mut resp = Response::new(Body::from_stream(body));
    *resp.status_mut() = head.status;
    resp.headers_mut().extend(head.headers);
    set_request_id(resp.headers_mut(), &request_id);
    resp
}

fn error_response(request_id: &str, err: RelayError) -> Response {
    let err = err.with_request_id(request_id);
    let mut resp = Response::new(Body::from(err.to_json()));
    *resp.status_mut() = err.status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    set_request_id(resp.headers_mut(), request_id);
    resp
}

fn auth_error_response(request_id: &str, err: AuthError) -> Response {
    let mut resp = Response::new(Body::from(err.body));
    *resp.status_mut() = err.status;
    resp.headers_mut().extend(err.headers);
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    set_request_id(resp.headers_mut(), request_id);
    resp
}

fn set_request_id(headers: &mut HeaderMap, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(REQUEST_ID, value);
    }
}

/// Caller supplied id, or a fresh one.
fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID)
        .or_else(|| headers.get("request-id"))
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
