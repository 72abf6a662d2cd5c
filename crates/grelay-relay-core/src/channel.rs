use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PRIORITY: i32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelType {
    /// OpenAI or any OpenAI-compatible endpoint authenticated by a static key.
    #[serde(rename = "openai")]
    OpenAI,
    /// OpenAI-compatible endpoint fronted by an OAuth client-credentials grant.
    #[serde(rename = "openai_oauth")]
    OpenAIOAuth,
}

impl ChannelType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelType::OpenAI => "openai",
            ChannelType::OpenAIOAuth => "openai_oauth",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Token endpoint for channels that exchange their key for a bearer token.
    #[serde(default)]
    pub token_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChannelType,
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub config: ChannelConfig,
}

fn default_enabled() -> bool {
    true
}

impl Channel {
    pub fn priority(&self) -> i32 {
        if self.priority == 0 {
            DEFAULT_PRIORITY
        } else {
            self.priority
        }
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.iter().any(|candidate| candidate == model)
    }

    pub fn map_model(&self, origin: &str) -> String {
        self.model_mapping
            .get(origin)
            .filter(|mapped| !mapped.is_empty())
            .cloned()
            .unwrap_or_else(|| origin.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> Channel {
        Channel {
            id: 1,
            kind: ChannelType::OpenAI,
            name: "primary".to_string(),
            base_url: String::new(),
            key: "sk-test".to_string(),
            models: vec!["gpt-4o".to_string()],
            model_mapping: HashMap::from([("gpt-4o".to_string(), "gpt-4o-2024-08-06".to_string())]),
            priority: 0,
            enabled: true,
            config: ChannelConfig::default(),
        }
    }

    #[test]
    fn zero_priority_means_default() {
        assert_eq!(channel().priority(), DEFAULT_PRIORITY);
    }

    #[test]
    fn mapping_falls_back_to_origin() {
        let channel = channel();
        assert_eq!(channel.map_model("gpt-4o"), "gpt-4o-2024-08-06");
        assert_eq!(channel.map_model("gpt-4o-mini"), "gpt-4o-mini");
    }
}
