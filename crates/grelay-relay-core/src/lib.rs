pub mod adaptor;
pub mod channel;
pub mod credential;
pub mod detail;
pub mod error;
pub mod memory;
pub mod meta;
pub mod mode;
pub mod price;
pub mod service;
pub mod task;
pub mod upstream;
pub mod usage;
pub mod writer;

pub use adaptor::{
    Adaptor, AdaptorRegistry, BodyStream, CallerRequest, ConvertedRequest, FormPart, ModelConfig,
    OutboundRequest, UpstreamResponse,
};
pub use channel::{Channel, ChannelConfig, ChannelType, DEFAULT_PRIORITY};
pub use credential::{CredentialCache, CredentialError, ExchangedToken, TokenExchanger};
pub use detail::{RequestDetail, truncate_content, truncate_text};
pub use error::{ErrorKind, RelayError};
pub use memory::{MemoryBalance, MemoryChannels, MemoryPricing, MemoryRecorder};
pub use meta::{GroupInfo, Meta, MetaBuilder, TokenInfo};
pub use mode::RelayMode;
pub use price::{BillingPrice, ModelPrice, TOKEN_PRICE_UNIT};
pub use service::{
    BalanceService, ChannelCatalog, ConsumeErrorRecord, ConsumeRecord, ConsumptionRecorder,
    GroupConsumer, PricingCatalog, ServiceError,
};
pub use task::BillingTasks;
pub use upstream::parse_upstream_error;
pub use usage::{PartialUsage, Usage, reconcile_usage};
pub use writer::{
    BufferPool, BufferPoolStats, CaptureWriter, ChannelWriter, CollectWriter, ResponseHead,
    ResponseReceiver, ResponseWriter, WriteError, response_channel,
};
