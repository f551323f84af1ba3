//! Reprojection engine settings.

use serde::{Deserialize, Serialize};

use crate::backend::EngineKind;

/// Settings controlling backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionConfig {
    /// Force a backend, or `auto` to rank them.
    #[serde(default)]
    pub engine: EngineKind,

    /// Allow the proj4rs backend (when compiled in).
    #[serde(default = "default_true")]
    pub enable_proj4: bool,

    /// Allow the EPSG.io backend.
    #[serde(default = "default_true")]
    pub enable_remote: bool,

    #[serde(default = "default_remote_url")]
    pub remote_url: String,

    #[serde(default = "default_ping_timeout")]
    pub remote_ping_timeout_secs: u64,

    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_secs: u64,

    /// Longest URL sent to the remote service.
    #[serde(default = "default_max_url_len")]
    pub max_url_len: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_true() -> bool {
    true
}

fn default_remote_url() -> String {
    "http://epsg.io".to_string()
}

fn default_ping_timeout() -> u64 {
    2
}

fn default_remote_timeout() -> u64 {
    60
}

fn default_max_url_len() -> usize {
    4000
}

pub fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0".to_string()
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Auto,
            enable_proj4: default_true(),
            enable_remote: default_true(),
            remote_url: default_remote_url(),
            remote_ping_timeout_secs: default_ping_timeout(),
            remote_timeout_secs: default_remote_timeout(),
            max_url_len: default_max_url_len(),
            user_agent: default_user_agent(),
        }
    }
}

impl ProjectionConfig {
    /// Configuration with only the closed-form backend available.
    pub fn builtin_only() -> Self {
        Self {
            enable_proj4: false,
            enable_remote: false,
            ..Default::default()
        }
    }
}
