//! # talkie-settings
//!
//! Layered settings for the Talkie hub.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** ([`TalkieSettings::default()`])
//! 2. **Settings file** (`~/.talkie/settings.json` or an explicit path, deep-merged)
//! 3. **Environment variables** (`TALKIE_*` overrides, highest priority)

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path, validate};
pub use types::*;
