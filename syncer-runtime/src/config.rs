//! Deployment-time configuration.

use std::time::Duration;

use serde::Deserialize;

/// Configuration shared by every controller the syncer runs.
///
/// All fields have working defaults; deployments typically only touch the
/// worker counts and the plugin enable/disable lists.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncerConfig {
    /// Workers per downward (multi-cluster) controller.
    pub dws_workers: usize,
    /// Workers per upward controller.
    pub uws_workers: usize,
    /// Requeue attempts before a key is surrendered to the patroller.
    pub max_retries: u32,
    /// Base delay of the per-key requeue backoff.
    #[serde(with = "millis")]
    pub requeue_base_delay: Duration,
    /// Cap of the per-key requeue backoff.
    #[serde(with = "millis")]
    pub requeue_max_delay: Duration,
    /// Interval between patrol passes. Coarse on purpose: patrol corrects
    /// drift, it is not the timeliness mechanism.
    #[serde(with = "millis")]
    pub patrol_period: Duration,
    /// Plugins enabled in addition to the registry defaults.
    pub enable: Vec<String>,
    /// Plugins disabled regardless of the registry defaults.
    pub disable: Vec<String>,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        SyncerConfig {
            dws_workers: 4,
            uws_workers: 4,
            max_retries: 10,
            requeue_base_delay: Duration::from_millis(5),
            requeue_max_delay: Duration::from_secs(60),
            patrol_period: Duration::from_secs(60),
            enable: Vec::new(),
            disable: Vec::new(),
        }
    }
}

impl SyncerConfig {
    /// Whether a plugin should run, given its registry default.
    pub fn plugin_enabled(&self, id: &str, enabled_by_default: bool) -> bool {
        if self.disable.iter().any(|d| d == id) {
            return false;
        }
        enabled_by_default || self.enable.iter().any(|e| e == id)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_beat_registry_defaults() {
        let config = SyncerConfig {
            enable: vec!["ingress".into()],
            disable: vec!["pod".into()],
            ..SyncerConfig::default()
        };
        assert!(config.plugin_enabled("ingress", false));
        assert!(!config.plugin_enabled("pod", true));
        assert!(config.plugin_enabled("storageclass", true));
        assert!(!config.plugin_enabled("crd", false));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: SyncerConfig =
            serde_json::from_str(r#"{"dws_workers": 2, "patrol_period": 5000}"#).unwrap();
        assert_eq!(config.dws_workers, 2);
        assert_eq!(config.patrol_period, Duration::from_secs(5));
        assert_eq!(config.uws_workers, 4);
    }
}
