use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use grelay_relay_core::{
    CallerRequest, Channel, ChannelCatalog, CollectWriter, Meta, RelayError, RelayMode,
    ResponseHead, ResponseWriter, Usage,
};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use rand::Rng;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::monitor::Monitor;
use crate::pipeline::Pipeline;

/// Error rates are clamped into this range before dividing the priority.
const MIN_ERROR_RATE: f64 = 0.1;
const MAX_ERROR_RATE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickError {
    NotFound,
    Exhausted,
}

fn weight(channel: &Channel, error_rate: f64) -> u64 {
    let priority = channel.priority().max(0) as f64;
    (priority / error_rate.clamp(MIN_ERROR_RATE, MAX_ERROR_RATE)) as u64
}

/// Weighted random choice among enabled channels not in `ignore`.
pub fn pick_channel<R: Rng>(
    rng: &mut R,
    channels: &[Arc<Channel>],
    error_rates: &HashMap<i64, f64>,
    ignore: &[i64],
) -> Result<Arc<Channel>, PickError> {
    if channels.is_empty() {
        return Err(PickError::NotFound);
    }
    let candidates: Vec<&Arc<Channel>> = channels
        .iter()
        .filter(|channel| channel.enabled && !ignore.contains(&channel.id))
        .collect();
    match candidates.as_slice() {
        [] => return Err(PickError::Exhausted),
        [only] => return Ok(Arc::clone(only)),
        _ => {}
    }

    let weights: Vec<u64> = candidates
        .iter()
        .map(|channel| weight(channel, error_rates.get(&channel.id).copied().unwrap_or(0.0)))
        .collect();
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return Ok(Arc::clone(candidates[rng.random_range(0..candidates.len())]));
    }
    let mut point = rng.random_range(0..total);
    for (channel, channel_weight) in candidates.iter().zip(&weights) {
        if point < *channel_weight {
            return Ok(Arc::clone(channel));
        }
        point -= channel_weight;
    }
    Ok(Arc::clone(candidates[candidates.len() - 1]))
}

/// Like [`pick_channel`], ignoring `ignore` when it excludes everything.
pub fn pick_with_fallback<R: Rng>(
    rng: &mut R,
    channels: &[Arc<Channel>],
    error_rates: &HashMap<i64, f64>,
    ignore: &[i64],
) -> Result<Arc<Channel>, PickError> {
    match pick_channel(rng, channels, error_rates, ignore) {
        Err(PickError::Exhausted) => pick_channel(rng, channels, error_rates, &[]),
        other => other,
    }
}

/// 401, 402 and 403 mean the channel itself lost access.
pub fn channel_has_permission(status: StatusCode) -> bool {
    !matches!(
        status,
        StatusCode::UNAUTHORIZED | StatusCode::PAYMENT_REQUIRED | StatusCode::FORBIDDEN
    )
}

/// Failures another channel could fix. Caller mistakes and local policy
/// rejections are final.
pub fn is_channel_failure(err: &RelayError) -> bool {
    if err.status == StatusCode::BAD_REQUEST {
        return false;
    }
    !err.is_local()
        || matches!(
            err.code.as_str(),
            "upstream_timeout" | "request_failed" | "unsupported_relay_mode"
        )
}

#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub request_id: String,
    pub request_at: OffsetDateTime,
    pub group: String,
    pub token_id: i64,
    pub token_name: String,
    pub mode: RelayMode,
    pub model: String,
    pub caller: CallerRequest,
}

#[derive(Debug)]
pub struct ChannelTestResult {
    pub status: StatusCode,
    pub body: Bytes,
    pub usage: Usage,
    pub elapsed: Duration,
}

struct RetryState {
    retries_left: u32,
    ignore: Vec<i64>,
    error_rates: HashMap<i64, f64>,
    last_permitted: Option<Arc<Channel>>,
    exhausted: bool,
}

/// Channel selection and the retry loop around [`Pipeline::dispatch`].
pub struct Relay {
    pipeline: Arc<Pipeline>,
    channels: Arc<dyn ChannelCatalog>,
    monitor: Arc<Monitor>,
}

impl Relay {
    pub fn new(
        pipeline: Arc<Pipeline>,
        channels: Arc<dyn ChannelCatalog>,
        monitor: Arc<Monitor>,
    ) -> Self {
        Self {
            pipeline,
            channels,
            monitor,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn channels(&self) -> &Arc<dyn ChannelCatalog> {
        &self.channels
    }

    /// Relays the request, retrying on other channels while nothing has
    /// reached the caller. The final error is written to `writer` when the
    /// head is still unwritten.
    pub async fn relay(
        &self,
        request: RelayRequest,
        writer: &mut dyn ResponseWriter,
    ) -> Result<Usage, RelayError> {
        let candidates = self.channels.channels_for_model(&request.model);
        let banned = self.monitor.banned_channels(&request.model);
        let error_rates = self.monitor.error_rates(&request.model);
        let first = pick_with_fallback(&mut rand::rng(), &candidates, &error_rates, &banned);
        let Ok(mut channel) = first else {
            warn!(
                event = "no_channel",
                request_id = %request.request_id,
                model = %request.model
            );
            return Err(self.fail(&request, RelayError::upstream_load_saturated(), writer).await);
        };

        let mut state = RetryState {
            retries_left: self.pipeline.config().retry_times,
            ignore: banned,
            error_rates,
            last_permitted: None,
            exhausted: false,
        };
        let mut attempt: u32 = 0;
        loop {
            let mut meta = self.build_meta(&request, channel.clone(), attempt);
            let result = self.pipeline.dispatch(&mut meta, &request.caller, writer).await;
            self.report(&meta, &result);
            let err = match result {
                Ok(usage) => return Ok(usage),
                Err(err) => err,
            };
            if !is_channel_failure(&err) || writer.head_written() {
                return Err(self.fail(&request, err, writer).await);
            }
            if writer.is_closed() {
                return Err(self.canceled(&request, &channel, writer).await);
            }

            if channel_has_permission(err.status) {
                state.last_permitted = Some(channel.clone());
            } else if state.exhausted {
                return Err(self.fail(&request, err, writer).await);
            } else {
                state.ignore.push(channel.id);
                if attempt > 0 {
                    state.retries_left += 1;
                }
            }
            if state.retries_left == 0 {
                return Err(self.fail(&request, err, writer).await);
            }
            state.retries_left -= 1;

            let next = if state.exhausted {
                state.last_permitted.clone()
            } else {
                match pick_channel(
                    &mut rand::rng(),
                    &candidates,
                    &state.error_rates,
                    &state.ignore,
                ) {
                    Ok(next) => Some(next),
                    Err(PickError::Exhausted) if state.last_permitted.is_some() => {
                        state.exhausted = true;
                        state.last_permitted.clone()
                    }
                    Err(_) => None,
                }
            };
            let Some(next) = next else {
                return Err(self.fail(&request, err, writer).await);
            };

            if err.status == StatusCode::TOO_MANY_REQUESTS {
                let jitter = rand::rng().random_range(0..1000);
                tokio::time::sleep(Duration::from_millis(1000 + jitter)).await;
                if writer.is_closed() {
                    return Err(self.canceled(&request, &channel, writer).await);
                }
            }
            attempt += 1;
            warn!(
                event = "relay_retry",
                request_id = %request.request_id,
                model = %request.model,
                failed_channel_id = channel.id,
                channel_id = next.id,
                retry = attempt,
                remaining = state.retries_left,
                status = err.status.as_u16()
            );
            channel = next;
        }
    }

    /// Sends a minimal chat call through `channel` as a health check: no
    /// balance read, no admission, no consumption record.
    pub async fn test_channel(
        &self,
        channel: Arc<Channel>,
        model: &str,
    ) -> Result<ChannelTestResult, RelayError> {
        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 1,
        });
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let caller = CallerRequest::new(
            Method::POST,
            "/v1/chat/completions",
            headers,
            Bytes::from(body.to_string()),
        );
        let channel_id = channel.id;
        let mut meta = Meta::builder(channel, RelayMode::ChatCompletions, model)
            .request_id(uuid::Uuid::new_v4().to_string())
            .endpoint("/v1/chat/completions")
            .health_check(true)
            .build();
        let mut writer = CollectWriter::new();
        let started_at = Instant::now();
        let usage = self.pipeline.dispatch(&mut meta, &caller, &mut writer).await?;
        let elapsed = started_at.elapsed();
        self.monitor.clear_channel(Some(model), channel_id);
        info!(
            event = "channel_test",
            channel_id,
            model = %model,
            elapsed_ms = elapsed.as_millis()
        );
        Ok(ChannelTestResult {
            status: writer.status().unwrap_or(StatusCode::OK),
            body: writer.body.freeze(),
            usage,
            elapsed,
        })
    }

    fn build_meta(&self, request: &RelayRequest, channel: Arc<Channel>, attempt: u32) -> Meta {
        Meta::builder(channel, request.mode, request.model.as_str())
            .request_id(request.request_id.as_str())
            .request_at(request.request_at)
            .group(request.group.as_str())
            .token(request.token_id, request.token_name.as_str())
            .endpoint(request.caller.endpoint.as_str())
            .retry_times(attempt)
            .build()
    }

    fn report(&self, meta: &Meta, result: &Result<Usage, RelayError>) {
        match result {
            Ok(_) => {
                self.monitor
                    .add_request(&meta.origin_model, meta.channel.id, false, false);
            }
            Err(err) if is_channel_failure(err) => {
                let outcome = self.monitor.add_request(
                    &meta.origin_model,
                    meta.channel.id,
                    true,
                    !channel_has_permission(err.status),
                );
                if outcome.banned {
                    warn!(
                        event = "channel_auto_banned",
                        channel_id = meta.channel.id,
                        channel = %meta.channel.name,
                        model = %meta.origin_model
                    );
                }
            }
            Err(_) => {}
        }
    }

    /// The caller left before any attempt reached it; nothing more is tried.
    async fn canceled(
        &self,
        request: &RelayRequest,
        channel: &Channel,
        writer: &mut dyn ResponseWriter,
    ) -> RelayError {
        info!(
            event = "client_canceled",
            request_id = %request.request_id,
            model = %request.model,
            channel_id = channel.id
        );
        self.fail(request, RelayError::client_canceled(), writer).await
    }

    async fn fail(
        &self,
        request: &RelayRequest,
        err: RelayError,
        writer: &mut dyn ResponseWriter,
    ) -> RelayError {
        let err = err.with_request_id(&request.request_id);
        if !writer.head_written() && !writer.is_closed() {
            let head = ResponseHead::with_content_type(err.status, "application/json");
            if writer.write_head(head).await.is_ok() {
                let _ = writer.write(err.to_json()).await;
            }
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use grelay_relay_core::{ChannelConfig, ChannelType};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn channel(id: i64, priority: i32, enabled: bool) -> Arc<Channel> {
        Arc::new(Channel {
            id,
            kind: ChannelType::OpenAI,
            name: format!("c{id}"),
            base_url: String::new(),
            key: String::new(),
            models: vec!["m".to_string()],
            model_mapping: HashMap::new(),
            priority,
            enabled,
            config: ChannelConfig::default(),
        })
    }

    #[test]
    fn error_rate_lowers_weight() {
        let healthy = channel(1, 100, true);
        assert_eq!(weight(&healthy, 0.0), 1000);
        assert_eq!(weight(&healthy, 0.5), 200);
        assert_eq!(weight(&healthy, 3.0), 100);
    }

    #[test]
    fn skips_disabled_and_ignored() {
        let channels = vec![channel(1, 10, false), channel(2, 10, true), channel(3, 10, true)];
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let picked = pick_channel(&mut rng, &channels, &HashMap::new(), &[3]).unwrap();
            assert_eq!(picked.id, 2);
        }
        assert_eq!(
            pick_channel(&mut rng, &channels, &HashMap::new(), &[2, 3]).unwrap_err(),
            PickError::Exhausted
        );
        assert_eq!(
            pick_channel(&mut rng, &[], &HashMap::new(), &[]).unwrap_err(),
            PickError::NotFound
        );
    }

    #[test]
    fn fallback_ignores_the_ignore_list() {
        let channels = vec![channel(1, 10, true)];
        let mut rng = StdRng::seed_from_u64(1);
        let picked = pick_with_fallback(&mut rng, &channels, &HashMap::new(), &[1]).unwrap();
        assert_eq!(picked.id, 1);
    }

    #[test]
    fn weighted_choice_favours_healthy_channels() {
        let channels = vec![channel(1, 100, true), channel(2, 100, true)];
        let rates = HashMap::from([(2, 1.0)]);
        let mut rng = StdRng::seed_from_u64(42);
        let mut first = 0;
        for _ in 0..1000 {
            if pick_channel(&mut rng, &channels, &rates, &[]).unwrap().id == 1 {
                first += 1;
            }
        }
        // weights 1000 vs 100
        assert!(first > 850, "picked healthy channel {first} times");
    }

    #[test]
    fn zero_weights_pick_uniformly() {
        let channels = vec![channel(1, -5, true), channel(2, -5, true)];
        let mut rng = StdRng::seed_from_u64(3);
        let picked = pick_channel(&mut rng, &channels, &HashMap::new(), &[]).unwrap();
        assert!(picked.id == 1 || picked.id == 2);
    }

    #[test]
    fn classifies_failures() {
        assert!(!channel_has_permission(StatusCode::PAYMENT_REQUIRED));
        assert!(channel_has_permission(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_channel_failure(&RelayError::upstream_timeout()));
        assert!(!is_channel_failure(&RelayError::insufficient_balance()));
        assert!(!is_channel_failure(&RelayError::upstream(400, None, None, "bad", None)));
        assert!(is_channel_failure(&RelayError::upstream(500, None, None, "boom", None)));
    }
}
