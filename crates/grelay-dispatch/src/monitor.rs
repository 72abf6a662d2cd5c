use std::collections::{HashMap, VecDeque};

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::config::MonitorConfig;

#[derive(Debug, Default)]
struct ChannelStats {
    samples: VecDeque<(Instant, bool)>,
    banned_until: Option<Instant>,
}

impl ChannelStats {
    fn prune(&mut self, now: Instant, config: &MonitorConfig) {
        let window = config.window();
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        if self.banned_until.is_some_and(|until| until <= now) {
            self.banned_until = None;
        }
    }

    fn error_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let errors = self.samples.iter().filter(|(_, is_error)| *is_error).count();
        errors as f64 / self.samples.len() as f64
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorOutcome {
    pub beyond_threshold: bool,
    pub banned: bool,
}

/// Sliding-window error rates per (model, channel), kept in process.
#[derive(Debug)]
pub struct Monitor {
    config: MonitorConfig,
    stats: DashMap<(String, i64), ChannelStats>,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            stats: DashMap::new(),
        }
    }

    /// `try_ban` bans on the spot, for channels that lost their permission.
    pub fn add_request(
        &self,
        model: &str,
        channel_id: i64,
        is_error: bool,
        try_ban: bool,
    ) -> MonitorOutcome {
        let now = Instant::now();
        let mut stats = self.stats.entry((model.to_string(), channel_id)).or_default();
        stats.prune(now, &self.config);
        if stats.banned_until.is_some() {
            return MonitorOutcome::default();
        }
        stats.samples.push_back((now, is_error));
        if !is_error {
            return MonitorOutcome::default();
        }

        let mut outcome = MonitorOutcome::default();
        if try_ban {
            outcome.banned = self.config.auto_ban_enabled;
        } else if stats.samples.len() as u64 >= self.config.min_requests
            && stats.error_rate() >= self.config.auto_ban_rate
        {
            outcome.beyond_threshold = true;
            outcome.banned = self.config.auto_ban_enabled;
        }

        if outcome.banned {
            stats.banned_until = Some(now + self.config.ban_duration());
            stats.samples.clear();
            error!(event = "channel_banned", model = %model, channel_id);
        } else if outcome.beyond_threshold {
            warn!(
                event = "channel_error_rate_beyond_threshold",
                model = %model,
                channel_id,
                error_rate = stats.error_rate()
            );
        }
        outcome
    }

    pub fn banned_channels(&self, model: &str) -> Vec<i64> {
        if !self.config.auto_ban_enabled {
            return Vec::new();
        }
        let now = Instant::now();
        let mut banned: Vec<i64> = self
            .stats
            .iter()
            .filter(|entry| entry.key().0 == model)
            .filter(|entry| entry.banned_until.is_some_and(|until| until > now))
            .map(|entry| entry.key().1)
            .collect();
        banned.sort_unstable();
        banned
    }

    pub fn error_rates(&self, model: &str) -> HashMap<i64, f64> {
        let now = Instant::now();
        let mut rates = HashMap::new();
        for mut entry in self.stats.iter_mut() {
            if entry.key().0 != model {
                continue;
            }
            let channel_id = entry.key().1;
            entry.prune(now, &self.config);
            rates.insert(channel_id, entry.error_rate());
        }
        rates
    }

    /// Forgets samples and bans of a channel, for one model or all of them.
    pub fn clear_channel(&self, model: Option<&str>, channel_id: i64) {
        self.stats.retain(|(stat_model, stat_channel), _| {
            !(*stat_channel == channel_id && model.is_none_or(|model| model == stat_model))
        });
    }
}
