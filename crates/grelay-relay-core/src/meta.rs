use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use time::OffsetDateTime;

use crate::channel::Channel;
use crate::mode::RelayMode;
use crate::price::{BillingPrice, ModelPrice};
use crate::usage::PartialUsage;

#[derive(Debug, Clone, Default)]
pub struct GroupInfo {
    pub id: String,
}

#[derive(Debug, Clone, Default)]
pub struct TokenInfo {
    pub id: i64,
    pub name: String,
}

/// Per-attempt request descriptor. Owned by the task handling the attempt and
/// handed by `&mut` to the active adaptor; never shared between attempts.
pub struct Meta {
    pub request_id: String,
    pub request_at: OffsetDateTime,
    pub group: GroupInfo,
    pub token: TokenInfo,
    pub channel: Arc<Channel>,
    pub origin_model: String,
    pub actual_model: String,
    pub mode: RelayMode,
    pub endpoint: String,
    pub price: ModelPrice,
    pub billing_price: BillingPrice,
    /// Pre-check estimate of the input side, used when the vendor reports no usage.
    pub input_tokens: u64,
    pub health_check: bool,
    pub retry_times: u32,
    /// Filled by the adaptor while the response is relayed.
    pub partial: PartialUsage,
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl fmt::Debug for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meta")
            .field("request_id", &self.request_id)
            .field("group", &self.group.id)
            .field("token", &self.token.name)
            .field("channel_id", &self.channel.id)
            .field("origin_model", &self.origin_model)
            .field("actual_model", &self.actual_model)
            .field("mode", &self.mode)
            .field("health_check", &self.health_check)
            .field("values", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub struct MetaBuilder {
    meta: Meta,
}

impl Meta {
    pub fn builder(channel: Arc<Channel>, mode: RelayMode, origin_model: impl Into<String>) -> MetaBuilder {
        let origin_model = origin_model.into();
        let actual_model = channel.map_model(&origin_model);
        MetaBuilder {
            meta: Meta {
                request_id: String::new(),
                request_at: OffsetDateTime::now_utc(),
                group: GroupInfo::default(),
                token: TokenInfo::default(),
                channel,
                origin_model,
                actual_model,
                mode,
                endpoint: String::new(),
                price: ModelPrice::default(),
                billing_price: BillingPrice::default(),
                input_tokens: 0,
                health_check: false,
                retry_times: 0,
                partial: PartialUsage::default(),
                values: HashMap::new(),
            },
        }
    }

    pub fn set<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values
            .get_mut(key)
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    /// Removes a value and hands over ownership, e.g. an opened connection.
    pub fn take<T: Any>(&mut self, key: &str) -> Option<T> {
        let value = self.values.remove(key)?;
        match value.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(value) => {
                self.values.insert(key.to_string(), value);
                None
            }
        }
    }

    /// Programmer-error assertion: the calling adaptor stored `key` earlier in
    /// the same attempt.
    pub fn must_get<T: Any>(&self, key: &str) -> &T {
        match self.get::<T>(key) {
            Some(value) => value,
            None => panic!("meta value `{key}` is missing or has an unexpected type"),
        }
    }

    pub fn get_string(&self, key: &str) -> &str {
        if let Some(value) = self.get::<String>(key) {
            return value.as_str();
        }
        self.get::<&'static str>(key).copied().unwrap_or("")
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get::<bool>(key).copied().unwrap_or(false)
    }

    pub fn base_url(&self) -> Option<&str> {
        let base = self.channel.base_url.trim();
        (!base.is_empty()).then_some(base)
    }
}

impl MetaBuilder {
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.meta.request_id = request_id.into();
        self
    }

    pub fn request_at(mut self, request_at: OffsetDateTime) -> Self {
        self.meta.request_at = request_at;
        self
    }

    pub fn group(mut self, id: impl Into<String>) -> Self {
        self.meta.group = GroupInfo { id: id.into() };
        self
    }

    pub fn token(mut self, id: i64, name: impl Into<String>) -> Self {
        self.meta.token = TokenInfo {
            id,
            name: name.into(),
        };
        self
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.meta.endpoint = endpoint.into();
        self
    }

    pub fn price(mut self, price: ModelPrice) -> Self {
        self.meta.billing_price = price.billing();
        self.meta.price = price;
        self
    }

    pub fn health_check(mut self, health_check: bool) -> Self {
        self.meta.health_check = health_check;
        self
    }

    pub fn retry_times(mut self, retry_times: u32) -> Self {
        self.meta.retry_times = retry_times;
        self
    }

    pub fn build(self) -> Meta {
        self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, ChannelType};

    fn meta() -> Meta {
        let channel = Channel {
            id: 7,
            kind: ChannelType::OpenAI,
            name: "c7".to_string(),
            base_url: "  ".to_string(),
            key: String::new(),
            models: vec!["m".to_string()],
            model_mapping: HashMap::from([("m".to_string(), "m-actual".to_string())]),
            priority: 0,
            enabled: true,
            config: ChannelConfig::default(),
        };
        Meta::builder(Arc::new(channel), RelayMode::ChatCompletions, "m")
            .request_id("r1")
            .group("g1")
            .build()
    }

    #[test]
    fn applies_model_mapping() {
        let meta = meta();
        assert_eq!(meta.origin_model, "m");
        assert_eq!(meta.actual_model, "m-actual");
        assert_eq!(meta.base_url(), None);
    }

    #[test]
    fn typed_accessors_return_zero_values() {
        let mut meta = meta();
        meta.set("stream", true);
        meta.set("format", "json".to_string());
        meta.set("count", 3_u32);

        assert!(meta.get_bool("stream"));
        assert_eq!(meta.get_string("format"), "json");
        assert!(!meta.get_bool("format"));
        assert_eq!(meta.get_string("missing"), "");
        assert_eq!(meta.get::<u32>("count"), Some(&3));
        assert_eq!(meta.get::<u64>("count"), None);
        assert_eq!(*meta.must_get::<u32>("count"), 3);

        assert!(meta.delete("count"));
        assert!(!meta.delete("count"));
    }

    #[test]
    fn take_keeps_value_on_type_mismatch() {
        let mut meta = meta();
        meta.set("conn", 5_i32);
        assert_eq!(meta.take::<String>("conn"), None);
        assert_eq!(meta.take::<i32>("conn"), Some(5));
        assert_eq!(meta.get::<i32>("conn"), None);
    }

    #[test]
    #[should_panic(expected = "meta value `absent`")]
    fn must_get_panics_on_absent_key() {
        let meta = meta();
        let _ = meta.must_get::<String>("absent");
    }
}
