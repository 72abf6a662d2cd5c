use std::io;
use std::sync::OnceLock;
use std::time::Instant;

use dashmap::DashMap;
use futures_util::StreamExt;
use grelay_relay_core::{Meta, OutboundRequest, RelayError, UpstreamResponse};
use tracing::{info, warn};
use wreq::multipart::Form;

static CLIENTS: OnceLock<DashMap<String, wreq::Client>> = OnceLock::new();

/// One pooled client per proxy setting, built on first use.
pub fn shared_client(proxy: Option<&str>) -> Result<wreq::Client, RelayError> {
    let clients = CLIENTS.get_or_init(DashMap::new);
    let key = proxy.unwrap_or("").to_string();
    if let Some(client) = clients.get(&key) {
        return Ok(client.clone());
    }
    let mut builder = wreq::Client::builder();
    if let Some(proxy) = proxy.filter(|proxy| !proxy.is_empty()) {
        let proxy = wreq::Proxy::all(proxy)
            .map_err(|err| RelayError::internal("invalid_proxy", err.to_string()))?;
        builder = builder.proxy(proxy);
    }
    let client = builder
        .build()
        .map_err(|err| RelayError::internal("client_build_failed", err.to_string()))?;
    clients.insert(key, client.clone());
    Ok(client)
}

pub fn transport_error(err: &wreq::Error) -> RelayError {
    if err.is_timeout() {
        RelayError::upstream_timeout()
    } else {
        RelayError::request_failed(err)
    }
}

/// Plain HTTP round trip; the body stays a stream.
pub async fn send(meta: &Meta, outbound: &OutboundRequest) -> Result<UpstreamResponse, RelayError> {
    execute(meta, outbound, None).await
}

/// Like [`send`], uploading `form` in place of the outbound body.
pub async fn send_multipart(
    meta: &Meta,
    outbound: &OutboundRequest,
    form: Form,
) -> Result<UpstreamResponse, RelayError> {
    execute(meta, outbound, Some(form)).await
}

async fn execute(
    meta: &Meta,
    outbound: &OutboundRequest,
    form: Option<Form>,
) -> Result<UpstreamResponse, RelayError> {
    let client = shared_client(None)?;
    let started_at = Instant::now();
    info!(
        event = "upstream_request",
        request_id = %meta.request_id,
        channel_id = meta.channel.id,
        mode = %meta.mode,
        model = %meta.actual_model,
        method = %outbound.method,
        url = %outbound.url
    );
    let request = client
        .request(outbound.method.clone(), outbound.url.as_str())
        .headers(outbound.headers.clone());
    let request = match form {
        Some(form) => request.multipart(form),
        None => request.body(outbound.body.clone()),
    };
    let response = request
        .send()
        .await
        .map_err(|err| {
            warn!(
                event = "upstream_response",
                request_id = %meta.request_id,
                channel_id = meta.channel.id,
                status = "error",
                elapsed_ms = started_at.elapsed().as_millis(),
                error = %err
            );
            transport_error(&err)
        })?;
    let status = response.status();
    info!(
        event = "upstream_response",
        request_id = %meta.request_id,
        channel_id = meta.channel.id,
        status = %status.as_u16(),
        elapsed_ms = started_at.elapsed().as_millis()
    );
    let headers = response.headers().clone();
    let body = response
        .bytes_stream()
        .map(|item| item.map_err(|err| io::Error::other(err.to_string())));
    Ok(UpstreamResponse::new(status, headers, Box::pin(body)))
}
