use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::channel::{Channel, ChannelType};
use crate::detail::RequestDetail;
use crate::meta::GroupInfo;
use crate::mode::RelayMode;
use crate::price::ModelPrice;

#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("group {0} not found")]
    GroupNotFound(String),
    #[error("balance service unavailable: {0}")]
    Unavailable(String),
    #[error("consume failed: {0}")]
    Consume(String),
    #[error("record failed: {0}")]
    Record(String),
}

/// Deducts from the group a balance was read for.
#[async_trait]
pub trait GroupConsumer: Send + Sync {
    /// Returns the amount actually deducted, which becomes the amount of record.
    async fn consume(&self, token_name: &str, amount: Decimal) -> Result<Decimal, ServiceError>;
}

#[async_trait]
pub trait BalanceService: Send + Sync {
    async fn group_remaining_balance(
        &self,
        group: &GroupInfo,
    ) -> Result<(Decimal, Box<dyn GroupConsumer>), ServiceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeRecord {
    pub request_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub request_at: OffsetDateTime,
    pub group_id: String,
    pub code: u16,
    pub channel_id: i64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model: String,
    pub token_id: i64,
    pub token_name: String,
    pub amount: Decimal,
    pub input_price: Decimal,
    pub output_price: Decimal,
    pub price_unit: Decimal,
    pub endpoint: String,
    pub content: String,
    pub mode: RelayMode,
    pub retry_times: u32,
    pub detail: Option<RequestDetail>,
}

/// Written when a deduction failed, so the lost amount can be reconciled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeErrorRecord {
    pub request_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub request_at: OffsetDateTime,
    pub group_id: String,
    pub token_id: i64,
    pub token_name: String,
    pub model: String,
    pub error: String,
    pub amount: Decimal,
}

#[async_trait]
pub trait ConsumptionRecorder: Send + Sync {
    async fn record_consumption(&self, record: ConsumeRecord) -> Result<(), ServiceError>;

    async fn record_consume_error(&self, record: ConsumeErrorRecord) -> Result<(), ServiceError>;
}

pub trait PricingCatalog: Send + Sync {
    fn model_price(&self, origin: &str, actual: &str, channel_type: ChannelType) -> Option<ModelPrice>;

    fn image_size_price(&self, model: &str, size: &str) -> Option<Decimal> {
        let price = self.model_price(model, model, ChannelType::OpenAI)?;
        price.image_prices.get(size).copied()
    }
}

pub trait ChannelCatalog: Send + Sync {
    /// Channels configured for `model`, disabled ones included.
    fn channels_for_model(&self, model: &str) -> Vec<Arc<Channel>>;

    fn channel(&self, id: i64) -> Option<Arc<Channel>>;
}
