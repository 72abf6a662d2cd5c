use grelay_core::{AuthContext, MemoryAuth};
use grelay_relay_core::{MemoryBalance, MemoryChannels, MemoryPricing};

use crate::config::GatewayConfig;

pub(crate) fn build_auth(config: &GatewayConfig) -> MemoryAuth {
    let mut auth = MemoryAuth::new();
    for token in &config.tokens {
        auth.insert(
            token.key.clone(),
            AuthContext {
                group: token.group.clone(),
                token_id: token.id,
                token_name: token.name.clone(),
            },
        );
    }
    auth
}

pub(crate) fn build_balance(config: &GatewayConfig) -> MemoryBalance {
    let balance = MemoryBalance::new();
    for group in &config.groups {
        balance.set_balance(group.id.clone(), group.balance);
    }
    balance
}

pub(crate) fn build_pricing(config: &GatewayConfig) -> MemoryPricing {
    MemoryPricing::new(config.price_table())
}

pub(crate) fn build_channels(config: &GatewayConfig) -> MemoryChannels {
    MemoryChannels::new(config.channels.iter().cloned())
}
