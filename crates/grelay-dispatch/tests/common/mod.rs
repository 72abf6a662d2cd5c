#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use grelay_dispatch::{Monitor, MonitorConfig, Pipeline, Relay, RelayConfig, RelayRequest};
use grelay_relay_core::{
    Adaptor, AdaptorRegistry, BalanceService, BillingTasks, CallerRequest, Channel, ChannelConfig,
    ChannelType, ConvertedRequest, GroupConsumer, GroupInfo, MemoryBalance, MemoryChannels,
    MemoryPricing, MemoryRecorder, Meta, ModelConfig, ModelPrice, OutboundRequest, RelayError,
    RelayMode, ResponseHead, ResponseWriter, ServiceError, UpstreamResponse, Usage,
};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use time::OffsetDateTime;

pub const MODEL: &str = "gpt-3.5-turbo";
pub const GROUP: &str = "g1";

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

/// What the fake upstream does for one channel.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed(Usage),
    Fail(u16, &'static str),
    Hang,
    /// Relays the text, then the connection breaks.
    BreakAfter(&'static str),
    /// Relays the text, then stops sending.
    StallAfter(&'static str),
}

/// Adaptor whose upstream is a per-channel script.
#[derive(Debug, Default)]
pub struct FakeAdaptor {
    behaviors: Mutex<HashMap<i64, Behavior>>,
    calls: Mutex<Vec<i64>>,
}

impl FakeAdaptor {
    pub fn set(&self, channel_id: i64, behavior: Behavior) {
        self.behaviors.lock().insert(channel_id, behavior);
    }

    pub fn calls(&self) -> Vec<i64> {
        self.calls.lock().clone()
    }

    fn behavior(&self, channel_id: i64) -> Behavior {
        self.behaviors
            .lock()
            .get(&channel_id)
            .cloned()
            .unwrap_or(Behavior::Succeed(Usage::new(1, 1)))
    }
}

fn json_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers
}

#[async_trait]
impl Adaptor for FakeAdaptor {
    fn channel_name(&self) -> &'static str {
        "fake"
    }

    fn base_url(&self) -> &'static str {
        "http://fake.invalid"
    }

    fn request_url(&self, meta: &Meta) -> Result<String, RelayError> {
        Ok(format!("http://fake.invalid/{}", meta.mode))
    }

    async fn convert_request(
        &self,
        _meta: &mut Meta,
        caller: &CallerRequest,
    ) -> Result<ConvertedRequest, RelayError> {
        Ok(ConvertedRequest {
            method: caller.method.clone(),
            headers: json_headers(),
            body: caller.body.clone(),
        })
    }

    async fn setup_request_header(
        &self,
        _meta: &Meta,
        _caller: &CallerRequest,
        _outbound: &mut OutboundRequest,
    ) -> Result<(), RelayError> {
        Ok(())
    }

    async fn do_request(
        &self,
        meta: &mut Meta,
        _caller: &CallerRequest,
        _outbound: &OutboundRequest,
    ) -> Result<UpstreamResponse, RelayError> {
        self.calls.lock().push(meta.channel.id);
        match self.behavior(meta.channel.id) {
            Behavior::Succeed(usage) => {
                meta.set("usage", usage);
                Ok(UpstreamResponse::from_bytes(
                    StatusCode::OK,
                    json_headers(),
                    r#"{"id":"ok"}"#,
                ))
            }
            Behavior::Fail(status, body) => Ok(UpstreamResponse::from_bytes(
                StatusCode::from_u16(status).unwrap(),
                json_headers(),
                body,
            )),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(UpstreamResponse::empty(StatusCode::OK))
            }
            Behavior::BreakAfter(_) | Behavior::StallAfter(_) => {
                Ok(UpstreamResponse::empty(StatusCode::OK))
            }
        }
    }

    async fn do_response(
        &self,
        meta: &mut Meta,
        writer: &mut dyn ResponseWriter,
        response: UpstreamResponse,
    ) -> Result<Option<Usage>, RelayError> {
        match self.behavior(meta.channel.id) {
            Behavior::BreakAfter(text) => {
                relay_text(meta, writer, text).await?;
                return Err(RelayError::request_failed("connection reset"));
            }
            Behavior::StallAfter(text) => {
                relay_text(meta, writer, text).await?;
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(None);
            }
            _ => {}
        }
        let status = response.status;
        let body = response.collect().await.map_err(RelayError::request_failed)?;
        writer
            .write_head(ResponseHead::new(status, json_headers()))
            .await
            .map_err(|err| RelayError::internal("write_failed", err.to_string()))?;
        writer
            .write(body)
            .await
            .map_err(|err| RelayError::internal("write_failed", err.to_string()))?;
        Ok(meta.take::<Usage>("usage"))
    }

    fn model_list(&self) -> Vec<ModelConfig> {
        Vec::new()
    }
}

async fn relay_text(
    meta: &mut Meta,
    writer: &mut dyn ResponseWriter,
    text: &str,
) -> Result<(), RelayError> {
    writer
        .write_head(ResponseHead::new(StatusCode::OK, json_headers()))
        .await
        .map_err(|err| RelayError::internal("write_failed", err.to_string()))?;
    writer
        .write(Bytes::from(text.to_string()))
        .await
        .map_err(|err| RelayError::internal("write_failed", err.to_string()))?;
    meta.partial.completion_text.push_str(text);
    Ok(())
}

/// Balance service whose backing store is unreachable.
pub struct FailingBalance;

#[async_trait]
impl BalanceService for FailingBalance {
    async fn group_remaining_balance(
        &self,
        _group: &GroupInfo,
    ) -> Result<(Decimal, Box<dyn GroupConsumer>), ServiceError> {
        Err(ServiceError::Unavailable("ledger unreachable".to_string()))
    }
}

pub fn channel(id: i64) -> Channel {
    Channel {
        id,
        kind: ChannelType::OpenAI,
        name: format!("c{id}"),
        base_url: String::new(),
        key: "sk-test".to_string(),
        models: vec![MODEL.to_string()],
        model_mapping: HashMap::new(),
        priority: 0,
        enabled: true,
        config: ChannelConfig::default(),
    }
}

pub fn price() -> ModelPrice {
    ModelPrice {
        input_price: dec("0.02"),
        output_price: dec("0.04"),
        price_unit: Decimal::ONE_THOUSAND,
        ..ModelPrice::default()
    }
}

pub struct Harness {
    pub relay: Relay,
    pub adaptor: Arc<FakeAdaptor>,
    pub balance: MemoryBalance,
    pub recorder: Arc<MemoryRecorder>,
    pub tasks: BillingTasks,
}

impl Harness {
    pub fn new(channels: Vec<Channel>, balance: &str, config: RelayConfig) -> Self {
        let balance = MemoryBalance::new().with_group(GROUP, dec(balance));
        Self::with_balance_service(channels, balance.clone(), Arc::new(balance), config)
    }

    pub fn with_balance_service(
        channels: Vec<Channel>,
        balance: MemoryBalance,
        service: Arc<dyn BalanceService>,
        config: RelayConfig,
    ) -> Self {
        let adaptor = Arc::new(FakeAdaptor::default());
        let registry = AdaptorRegistry::new().with(ChannelType::OpenAI, adaptor.clone());
        let pricing = MemoryPricing::default().with_price(MODEL, price());
        let recorder = Arc::new(MemoryRecorder::new());
        let tasks = BillingTasks::new();
        let monitor = Arc::new(Monitor::new(config.monitor.clone()));
        let pipeline = Pipeline::new(
            registry,
            service,
            Arc::new(pricing),
            recorder.clone(),
            tasks.clone(),
            Arc::new(config),
        );
        let relay = Relay::new(
            Arc::new(pipeline),
            Arc::new(MemoryChannels::new(channels)),
            monitor,
        );
        Self {
            relay,
            adaptor,
            balance,
            recorder,
            tasks,
        }
    }

    /// Waits for detached billing to settle.
    pub async fn settle(&self) {
        self.tasks.drain().await;
    }
}

pub fn chat_request(body: serde_json::Value) -> RelayRequest {
    let caller = CallerRequest::new(
        Method::POST,
        "/v1/chat/completions",
        json_headers(),
        Bytes::from(body.to_string()),
    );
    RelayRequest {
        request_id: "req-1".to_string(),
        request_at: OffsetDateTime::now_utc(),
        group: GROUP.to_string(),
        token_id: 7,
        token_name: "t1".to_string(),
        mode: RelayMode::ChatCompletions,
        model: MODEL.to_string(),
        caller,
    }
}

pub fn hello(max_tokens: u64) -> RelayRequest {
    chat_request(serde_json::json!({
        "model": MODEL,
        "max_tokens": max_tokens,
        "messages": [{"role": "user", "content": "hello"}]
    }))
}
