use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Usage billed when the upstream reported nothing measurable.
    pub fn from_estimate(input_tokens: u64) -> Self {
        Self::new(input_tokens, 0)
    }

    /// Brings a vendor-reported usage into the `total = prompt + completion`
    /// shape. Vendors that only report a total get their prompt side filled
    /// from the pre-check estimate and the remainder booked as completion.
    pub fn reconcile(mut self, estimated_input: u64) -> Self {
        if self.total_tokens == 0 {
            self.total_tokens = self.prompt_tokens.saturating_add(self.completion_tokens);
        } else if self.prompt_tokens == 0 {
            self.prompt_tokens = estimated_input.min(self.total_tokens);
            self.completion_tokens = self.total_tokens - self.prompt_tokens;
        }
        self
    }
}

/// What an adaptor saw while relaying a response. Read back when the attempt
/// fails after content already reached the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialUsage {
    pub reported: Option<Usage>,
    pub completion_text: String,
}

impl PartialUsage {
    pub fn is_empty(&self) -> bool {
        self.reported.is_none() && self.completion_text.is_empty()
    }
}

pub fn reconcile_usage(usage: Option<Usage>, estimated_input: u64) -> Usage {
    match usage {
        Some(usage) => usage.reconcile(estimated_input),
        None => Usage::from_estimate(estimated_input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_total_from_parts() {
        let usage = Usage {
            prompt_tokens: 12,
            completion_tokens: 30,
            total_tokens: 0,
        }
        .reconcile(99);
        assert_eq!(usage, Usage::new(12, 30));
    }

    #[test]
    fn back_fills_prompt_from_estimate() {
        let usage = Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 150,
        }
        .reconcile(100);
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 50);
        assert_eq!(usage.total_tokens, 150);
    }

    #[test]
    fn estimate_larger_than_total_is_clamped() {
        let usage = Usage {
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 10,
        }
        .reconcile(40);
        assert_eq!(usage, Usage::new(10, 0));
    }

    #[test]
    fn oversized_vendor_counts_saturate() {
        assert_eq!(Usage::new(u64::MAX, 5).total_tokens, u64::MAX);
        let usage = Usage {
            prompt_tokens: u64::MAX,
            completion_tokens: u64::MAX,
            total_tokens: 0,
        }
        .reconcile(10);
        assert_eq!(usage.total_tokens, u64::MAX);
    }

    #[test]
    fn missing_usage_uses_estimate() {
        assert_eq!(reconcile_usage(None, 7), Usage::new(7, 0));
    }
}
