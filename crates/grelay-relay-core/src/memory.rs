use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::channel::{Channel, ChannelType};
use crate::meta::GroupInfo;
use crate::price::ModelPrice;
use crate::service::{
    BalanceService, ChannelCatalog, ConsumeErrorRecord, ConsumeRecord, ConsumptionRecorder,
    GroupConsumer, PricingCatalog, ServiceError,
};

#[derive(Debug, Clone, Default)]
pub struct MemoryBalance {
    balances: Arc<DashMap<String, Decimal>>,
}

impl MemoryBalance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(self, group: impl Into<String>, balance: Decimal) -> Self {
        self.set_balance(group, balance);
        self
    }

    pub fn set_balance(&self, group: impl Into<String>, balance: Decimal) {
        self.balances.insert(group.into(), balance);
    }

    pub fn balance(&self, group: &str) -> Option<Decimal> {
        self.balances.get(group).map(|entry| *entry)
    }
}

#[async_trait]
impl BalanceService for MemoryBalance {
    async fn group_remaining_balance(
        &self,
        group: &GroupInfo,
    ) -> Result<(Decimal, Box<dyn GroupConsumer>), ServiceError> {
        let balance = self
            .balance(&group.id)
            .ok_or_else(|| ServiceError::GroupNotFound(group.id.clone()))?;
        let consumer = MemoryConsumer {
            balances: self.balances.clone(),
            group: group.id.clone(),
        };
        Ok((balance, Box::new(consumer)))
    }
}

struct MemoryConsumer {
    balances: Arc<DashMap<String, Decimal>>,
    group: String,
}

#[async_trait]
impl GroupConsumer for MemoryConsumer {
    async fn consume(&self, _token_name: &str, amount: Decimal) -> Result<Decimal, ServiceError> {
        let mut balance = self
            .balances
            .get_mut(&self.group)
            .ok_or_else(|| ServiceError::GroupNotFound(self.group.clone()))?;
        *balance -= amount;
        Ok(amount)
    }
}

#[derive(Debug, Default)]
pub struct MemoryRecorder {
    records: Mutex<Vec<ConsumeRecord>>,
    errors: Mutex<Vec<ConsumeErrorRecord>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ConsumeRecord> {
        self.records.lock().clone()
    }

    pub fn errors(&self) -> Vec<ConsumeErrorRecord> {
        self.errors.lock().clone()
    }
}

#[async_trait]
impl ConsumptionRecorder for MemoryRecorder {
    async fn record_consumption(&self, record: ConsumeRecord) -> Result<(), ServiceError> {
        self.records.lock().push(record);
        Ok(())
    }

    async fn record_consume_error(&self, record: ConsumeErrorRecord) -> Result<(), ServiceError> {
        self.errors.lock().push(record);
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryPricing {
    prices: HashMap<String, ModelPrice>,
}

impl MemoryPricing {
    pub fn new(prices: HashMap<String, ModelPrice>) -> Self {
        Self { prices }
    }

    pub fn with_price(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.prices.insert(model.into(), price);
        self
    }
}

impl PricingCatalog for MemoryPricing {
    /// The mapped model's price wins over the requested one.
    fn model_price(&self, origin: &str, actual: &str, _channel_type: ChannelType) -> Option<ModelPrice> {
        self.prices
            .get(actual)
            .or_else(|| self.prices.get(origin))
            .cloned()
    }

    fn image_size_price(&self, model: &str, size: &str) -> Option<Decimal> {
        self.prices.get(model)?.image_prices.get(size).copied()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryChannels {
    channels: Vec<Arc<Channel>>,
}

impl MemoryChannels {
    pub fn new(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            channels: channels.into_iter().map(Arc::new).collect(),
        }
    }
}

impl ChannelCatalog for MemoryChannels {
    fn channels_for_model(&self, model: &str) -> Vec<Arc<Channel>> {
        self.channels
            .iter()
            .filter(|channel| channel.serves(model))
            .cloned()
            .collect()
    }

    fn channel(&self, id: i64) -> Option<Arc<Channel>> {
        self.channels.iter().find(|channel| channel.id == id).cloned()
    }
}
