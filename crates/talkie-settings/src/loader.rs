//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TalkieSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `TALKIE_*` environment variable overrides (highest priority)
//! 4. Validate the result

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::{BusBackend, TalkieSettings};

/// Resolve the default settings file path (`~/.talkie/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".talkie").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TalkieSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or out-of-range values are
/// errors.
pub fn load_settings_from_path(path: &Path) -> Result<TalkieSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn read_file_layer(path: &Path) -> Result<TalkieSettings> {
    let defaults = serde_json::to_value(TalkieSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Reject settings the hub cannot run with.
pub fn validate(settings: &TalkieSettings) -> Result<()> {
    if settings.server.host.trim().is_empty() {
        return Err(SettingsError::InvalidValue("server.host is empty".into()));
    }
    if settings
        .server
        .directory_seed
        .as_deref()
        .is_some_and(|seed| seed.trim().is_empty())
    {
        return Err(SettingsError::InvalidValue(
            "server.directorySeed is empty".into(),
        ));
    }
    let hub = &settings.hub;
    if hub.queue_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "hub.queueCapacity must be at least 1".into(),
        ));
    }
    if hub.control_queue_capacity == 0 || hub.presence_channel_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "hub channel capacities must be at least 1".into(),
        ));
    }
    if hub.pong_wait_ms < 10 {
        return Err(SettingsError::InvalidValue(format!(
            "hub.pongWaitMs must be at least 10, got {}",
            hub.pong_wait_ms
        )));
    }
    if hub.write_wait_ms == 0 {
        return Err(SettingsError::InvalidValue(
            "hub.writeWaitMs must be at least 1".into(),
        ));
    }
    if hub.max_frame_bytes == 0 {
        return Err(SettingsError::InvalidValue(
            "hub.maxFrameBytes must be at least 1".into(),
        ));
    }
    if settings.bus.channel.is_empty() {
        return Err(SettingsError::InvalidValue("bus.channel is empty".into()));
    }
    if settings.bus.backend == BusBackend::Local && settings.bus.local_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "bus.localCapacity must be at least 1".into(),
        ));
    }
    Ok(())
}

/// Apply environment variable overrides to loaded settings.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`. Invalid values are logged
/// and ignored.
pub fn apply_env_overrides(settings: &mut TalkieSettings) {
    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TALKIE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("TALKIE_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_string("TALKIE_DIRECTORY_SEED") {
        settings.server.directory_seed = Some(v);
    }

    // ── Hub ─────────────────────────────────────────────────────────
    if let Some(v) = read_env_usize("TALKIE_QUEUE_CAPACITY", 1, 65_536) {
        settings.hub.queue_capacity = v;
    }
    if let Some(v) = read_env_u64("TALKIE_PONG_WAIT_MS", 1000, 3_600_000) {
        settings.hub.pong_wait_ms = v;
    }
    if let Some(v) = read_env_u64("TALKIE_WRITE_WAIT_MS", 100, 600_000) {
        settings.hub.write_wait_ms = v;
    }
    if let Some(v) = read_env_usize("TALKIE_MAX_FRAME_BYTES", 128, 16 * 1024 * 1024) {
        settings.hub.max_frame_bytes = v;
    }
    if let Some(v) = read_env_bool("TALKIE_COALESCE_WRITES") {
        settings.hub.coalesce_writes = v;
    }

    // ── Bus ─────────────────────────────────────────────────────────
    if let Some(v) = read_env_string("TALKIE_BUS_BACKEND") {
        match BusBackend::parse(&v) {
            Some(backend) => settings.bus.backend = backend,
            None => tracing::warn!(key = "TALKIE_BUS_BACKEND", value = %v, "unknown bus backend, ignoring"),
        }
    }
    if let Some(v) = read_env_string("TALKIE_REDIS_URL") {
        settings.bus.redis_url = v;
    }
    if let Some(v) = read_env_string("TALKIE_BUS_CHANNEL") {
        settings.bus.channel = v;
    }
    if let Some(v) = read_env_u64("TALKIE_RESUBSCRIBE_DELAY_MS", 10, 600_000) {
        settings.bus.resubscribe_delay_ms = v;
    }

    // ── Auth / logging ──────────────────────────────────────────────
    if let Some(v) = read_env_string("TALKIE_JWT_SECRET") {
        settings.auth.jwt_secret = v;
    }
    if let Some(v) = read_env_string("TALKIE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read_env_bool("TALKIE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────────────

fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn read_env_bool(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_env_u16(name: &str, min: u16, max: u16) -> Option<u16> {
    let val = std::env::var(name).ok()?;
    let result = parse_u16_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u16 env var, ignoring");
    }
    result
}

fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}
