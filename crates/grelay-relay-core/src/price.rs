use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Token count that token prices are quoted against.
pub const TOKEN_PRICE_UNIT: Decimal = Decimal::ONE_THOUSAND;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    #[serde(default)]
    pub input_price: Decimal,
    #[serde(default)]
    pub output_price: Decimal,
    #[serde(default = "default_price_unit")]
    pub price_unit: Decimal,
    /// Per-image price keyed by size, e.g. `1024x1024`.
    #[serde(default)]
    pub image_prices: HashMap<String, Decimal>,
    #[serde(default)]
    pub rpm: u64,
    #[serde(default)]
    pub tpm: u64,
}

fn default_price_unit() -> Decimal {
    TOKEN_PRICE_UNIT
}

impl Default for ModelPrice {
    fn default() -> Self {
        Self {
            input_price: Decimal::ZERO,
            output_price: Decimal::ZERO,
            price_unit: TOKEN_PRICE_UNIT,
            image_prices: HashMap::new(),
            rpm: 0,
            tpm: 0,
        }
    }
}

impl ModelPrice {
    pub fn billing(&self) -> BillingPrice {
        BillingPrice {
            input_price: self.input_price,
            output_price: self.output_price,
            price_unit: self.price_unit,
        }
    }
}

/// Prices actually applied to a single attempt. Token modes copy them from the
/// model price; per-image and per-character modes substitute their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPrice {
    pub input_price: Decimal,
    pub output_price: Decimal,
    pub price_unit: Decimal,
}

impl Default for BillingPrice {
    fn default() -> Self {
        Self {
            input_price: Decimal::ZERO,
            output_price: Decimal::ZERO,
            price_unit: TOKEN_PRICE_UNIT,
        }
    }
}

impl BillingPrice {
    pub fn per_item(price: Decimal) -> Self {
        Self {
            input_price: price,
            output_price: Decimal::ZERO,
            price_unit: Decimal::ONE,
        }
    }
}
