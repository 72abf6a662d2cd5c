pub mod openai;

use std::sync::Arc;

use grelay_relay_core::{AdaptorRegistry, ChannelType, CredentialCache};

pub use openai::{OpenAIAdaptor, OpenAIOAuthAdaptor};

/// Every backend this build ships, keyed by channel type.
pub fn build_registry(credentials: CredentialCache) -> AdaptorRegistry {
    AdaptorRegistry::new()
        .with(ChannelType::OpenAI, Arc::new(OpenAIAdaptor))
        .with(ChannelType::OpenAIOAuth, Arc::new(OpenAIOAuthAdaptor::new(credentials)))
}
