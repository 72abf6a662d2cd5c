use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::channel::ChannelType;
use crate::error::RelayError;
use crate::meta::Meta;
use crate::price::ModelPrice;
use crate::upstream::parse_upstream_error;
use crate::usage::Usage;
use crate::writer::ResponseWriter;

pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// Error bodies larger than this are cut before parsing.
pub const ERROR_BODY_LIMIT: usize = 64 * 1024;

/// One field of a multipart form body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    pub name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FormPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_name: None,
            content_type: None,
            data: Bytes::from(value.into()),
        }
    }

    pub fn is_file(&self) -> bool {
        self.file_name.is_some()
    }
}

/// The inbound call as the front end received it. Multipart bodies also
/// arrive split into `form`.
#[derive(Debug, Clone)]
pub struct CallerRequest {
    pub method: Method,
    pub endpoint: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub form: Vec<FormPart>,
}

impl CallerRequest {
    pub fn new(method: Method, endpoint: impl Into<String>, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            headers,
            body,
            form: Vec::new(),
        }
    }

    pub fn with_form(mut self, form: Vec<FormPart>) -> Self {
        self.form = form;
        self
    }

    pub fn form_value(&self, name: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|part| part.name == name && !part.is_file())
            .and_then(|part| std::str::from_utf8(&part.data).ok())
    }

    pub fn has_file(&self, name: &str) -> bool {
        self.form.iter().any(|part| part.name == name && part.is_file())
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub struct ConvertedRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self::new(
            status,
            headers,
            Box::pin(futures_util::stream::once(async move { Ok::<_, io::Error>(body) })),
        )
    }

    pub fn empty(status: StatusCode) -> Self {
        Self::new(
            status,
            HeaderMap::new(),
            Box::pin(futures_util::stream::empty::<Result<Bytes, io::Error>>()),
        )
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
    }

    pub fn is_event_stream(&self) -> bool {
        self.content_type().starts_with("text/event-stream")
    }

    pub async fn collect(self) -> Result<Bytes, io::Error> {
        self.collect_limited(usize::MAX).await
    }

    /// Reads the body up to `limit` bytes; the rest is drained and dropped.
    pub async fn collect_limited(mut self, limit: usize) -> Result<Bytes, io::Error> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            let chunk = chunk?;
            let remaining = limit.saturating_sub(buf.len());
            if remaining > 0 {
                buf.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
            }
        }
        Ok(buf.freeze())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    pub owned_by: String,
    #[serde(default)]
    pub price: ModelPrice,
}

/// Vendor backend. One instance per channel type, shared by every attempt.
///
/// `do_response` writes exactly one terminal response on success and nothing
/// on error. It returns `None` when the vendor reported no measurable usage.
#[async_trait]
pub trait Adaptor: Send + Sync {
    fn channel_name(&self) -> &'static str;

    /// Used when the channel has no base URL configured.
    fn base_url(&self) -> &'static str;

    fn request_url(&self, meta: &Meta) -> Result<String, RelayError>;

    async fn convert_request(
        &self,
        meta: &mut Meta,
        caller: &CallerRequest,
    ) -> Result<ConvertedRequest, RelayError>;

    async fn setup_request_header(
        &self,
        meta: &Meta,
        caller: &CallerRequest,
        outbound: &mut OutboundRequest,
    ) -> Result<(), RelayError>;

    async fn do_request(
        &self,
        meta: &mut Meta,
        caller: &CallerRequest,
        outbound: &OutboundRequest,
    ) -> Result<UpstreamResponse, RelayError>;

    async fn do_response(
        &self,
        meta: &mut Meta,
        writer: &mut dyn ResponseWriter,
        response: UpstreamResponse,
    ) -> Result<Option<Usage>, RelayError>;

    /// Turns a non-success upstream response into an error.
    async fn handle_error(&self, meta: &Meta, response: UpstreamResponse) -> RelayError {
        let _ = meta;
        let status = response.status;
        match response.collect_limited(ERROR_BODY_LIMIT).await {
            Ok(body) => parse_upstream_error(status, &body),
            Err(err) => RelayError::request_failed(err),
        }
    }

    fn model_list(&self) -> Vec<ModelConfig>;
}

/// Closed map from channel type to backend, built once at startup.
#[derive(Clone, Default)]
pub struct AdaptorRegistry {
    adaptors: HashMap<ChannelType, Arc<dyn Adaptor>>,
}

impl fmt::Debug for AdaptorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.adaptors.keys()).finish()
    }
}

impl AdaptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: ChannelType, adaptor: Arc<dyn Adaptor>) {
        self.adaptors.insert(kind, adaptor);
    }

    pub fn with(mut self, kind: ChannelType, adaptor: Arc<dyn Adaptor>) -> Self {
        self.register(kind, adaptor);
        self
    }

    pub fn get(&self, kind: ChannelType) -> Option<Arc<dyn Adaptor>> {
        self.adaptors.get(&kind).cloned()
    }

    pub fn kinds(&self) -> impl Iterator<Item = ChannelType> + '_ {
        self.adaptors.keys().copied()
    }
}
