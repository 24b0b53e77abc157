use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 60000ms)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    60_000
}

/// Playback smoothing defaults applied when the caller does not pass an
/// explicit smoothing setting per call.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AnimationCfg {
    /// Animate assistant text character by character (default off; text
    /// renders fine unsmoothed, smoothing is opt-in per call).
    #[serde(default)]
    pub smooth_text: bool,
    /// Animate tool-call argument fragments (default on).
    #[serde(default = "default_smooth_tool_calls")]
    pub smooth_tool_calls: bool,
    /// Fixed drain speed in characters per tick. None = adaptive
    /// (start slow, switch to catch-up when the producer is done).
    #[serde(default)]
    pub speed: Option<usize>,
}

impl Default for AnimationCfg {
    fn default() -> Self {
        Self {
            smooth_text: false,
            smooth_tool_calls: default_smooth_tool_calls(),
            speed: None,
        }
    }
}

fn default_smooth_tool_calls() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct StreamCfg {
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub animation: AnimationCfg,
}

impl StreamCfg {
    /// Load a StreamCfg from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::StreamError::from)?;
        let s =
            std::str::from_utf8(&bytes).map_err(|e| crate::error::StreamError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::StreamError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::StreamError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::StreamError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::StreamError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }
}
