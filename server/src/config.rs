//! Hub configuration

use alarm_stream_shared::defaults;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Listen address
    pub bind: String,
    /// Path of the push endpoint
    pub path: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:18080".into(),
            path: defaults::ALARM_CHANNEL_PATH.into(),
        }
    }
}
