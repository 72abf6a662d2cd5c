use std::sync::Arc;

use async_trait::async_trait;
use grelay_relay_core::{
    Adaptor, CallerRequest, ConvertedRequest, CredentialCache, CredentialError, ExchangedToken,
    Meta, ModelConfig, OutboundRequest, RelayError, ResponseWriter, TokenExchanger,
    UpstreamResponse, Usage,
};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::client::shared_client;

use super::{
    DEFAULT_BASE_URL, bearer, convert_body, default_models, relay_response, request_url,
    send_request,
};

pub const CHANNEL_NAME: &str = "openai_oauth";
const DEFAULT_EXPIRES_IN: i64 = 3600;

#[derive(Serialize)]
struct TokenRequest<'a> {
    grant_type: &'static str,
    client_id: &'a str,
    client_secret: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
}

/// OAuth2 client-credentials grant. The channel key is `client_id|client_secret`.
#[derive(Debug, Clone)]
pub struct ClientCredentialsExchanger {
    token_url: String,
}

impl ClientCredentialsExchanger {
    pub fn new(token_url: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
        }
    }
}

pub fn split_key(credential: &str) -> Result<(&str, &str), CredentialError> {
    match credential.split_once('|') {
        Some((id, secret)) if !id.is_empty() && !secret.is_empty() => Ok((id, secret)),
        _ => Err(CredentialError::Invalid(
            "expected client_id|client_secret".to_string(),
        )),
    }
}

#[async_trait]
impl TokenExchanger for ClientCredentialsExchanger {
    async fn exchange(&self, credential: &str) -> Result<ExchangedToken, CredentialError> {
        let (client_id, client_secret) = split_key(credential)?;
        let client =
            shared_client(None).map_err(|err| CredentialError::Exchange(err.message))?;
        let request = TokenRequest {
            grant_type: "client_credentials",
            client_id,
            client_secret,
        };
        let response = client
            .post(self.token_url.as_str())
            .header(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            )
            .form(&request)
            .send()
            .await
            .map_err(|err| CredentialError::Exchange(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("{status}: {body}");
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::BAD_REQUEST {
                return Err(CredentialError::Invalid(message));
            }
            return Err(CredentialError::Exchange(message));
        }
        let payload = response
            .json::<TokenResponse>()
            .await
            .map_err(|err| CredentialError::Exchange(err.to_string()))?;
        let access_token = payload
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| CredentialError::Exchange("response missing access_token".to_string()))?;
        let expires_in = payload.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        info!(event = "token_exchanged", client_id = %client_id, expires_in);
        Ok(ExchangedToken {
            access_token,
            expires_at: OffsetDateTime::now_utc() + Duration::seconds(expires_in),
        })
    }
}

fn credential_error(err: CredentialError) -> RelayError {
    match err {
        CredentialError::Invalid(message) => RelayError::internal("invalid_channel_key", message),
        CredentialError::Exchange(message) => RelayError::request_failed(message),
    }
}

/// OpenAI-compatible endpoint whose bearer token comes from a token exchange.
#[derive(Debug, Clone, Default)]
pub struct OpenAIOAuthAdaptor {
    credentials: CredentialCache,
}

impl OpenAIOAuthAdaptor {
    pub fn new(credentials: CredentialCache) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl Adaptor for OpenAIOAuthAdaptor {
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
        let token_url = meta
            .channel
            .config
            .token_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                RelayError::internal("missing_token_url", "oauth channel has no token_url")
            })?;
        let exchanger: Arc<dyn TokenExchanger> = Arc::new(ClientCredentialsExchanger::new(token_url));
        let token = self
            .credentials
            .get_or_exchange(&meta.channel.key, exchanger)
            .await
            .map_err(credential_error)?;
        outbound.headers.insert(AUTHORIZATION, bearer(&token)?);
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

    /// A rejected token is dropped so the next attempt exchanges a new one.
    async fn handle_error(&self, meta: &Meta, response: UpstreamResponse) -> RelayError {
        if response.status == StatusCode::UNAUTHORIZED {
            warn!(
                event = "token_rejected",
                request_id = %meta.request_id,
                channel_id = meta.channel.id
            );
            self.credentials.invalidate(&meta.channel.key);
        }
        let status = response.status;
        match response
            .collect_limited(grelay_relay_core::adaptor::ERROR_BODY_LIMIT)
            .await
        {
            Ok(body) => grelay_relay_core::parse_upstream_error(status, &body),
            Err(err) => RelayError::request_failed(err),
        }
    }

    fn model_list(&self) -> Vec<ModelConfig> {
        default_models()
    }
}
