//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file may specify any subset of fields and the rest keep their defaults.

mod bus;
mod hub;

pub use bus::*;
pub use hub::*;

use serde::{Deserialize, Serialize};

/// Root settings type for the hub.
///
/// ```json
/// {
///   "server": { "port": 8080 },
///   "bus": { "backend": "redis", "redisUrl": "redis://127.0.0.1:6379" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TalkieSettings {
    /// HTTP listener.
    pub server: ServerSettings,
    /// Connection registry and pump tuning.
    pub hub: HubSettings,
    /// Fan-out bus backend.
    pub bus: BusSettings,
    /// Identity verification.
    pub auth: AuthSettings,
    /// Logging output.
    pub logging: LoggingSettings,
}

/// HTTP listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (0 picks an ephemeral port).
    pub port: u16,
    /// Optional seed file for the in-memory conversation directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory_seed: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            directory_seed: None,
        }
    }
}

/// Identity verification settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HMAC secret for HS256 access tokens.
    pub jwt_secret: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me-in-production".to_string(),
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit one JSON object per line instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
