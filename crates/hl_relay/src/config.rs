use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    /// Lifetime of tokens minted by the relay.
    pub session_ttl_secs: u64,
    /// `user:token` pairs accepted at startup.
    pub sessions: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7700".into(),
            session_ttl_secs: 86_400,
            sessions: Vec::new(),
        }
    }
}
