//! # talkie-gateway
//!
//! Talkie hub binary: loads settings, wires collaborators and the bus, and
//! serves the `WebSocket` gateway until interrupted.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use talkie_core::InMemoryDirectory;
use talkie_core::logging::{LogFormat, init_subscriber};
use talkie_server::auth::JwtVerifier;
use talkie_server::bus::{LocalBus, MessageBus};
use talkie_server::config::ServerConfig;
use talkie_server::server::{Collaborators, HubServer};
use talkie_settings::{BusBackend, TalkieSettings};

/// How long shutdown waits for background tasks.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Talkie real-time connection hub.
#[derive(Parser, Debug)]
#[command(name = "talkie-gateway", about = "Talkie real-time connection hub")]
struct Cli {
    /// Settings file (defaults to `~/.talkie/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Conversation seed file for the in-memory directory (overrides settings).
    #[arg(long)]
    directory: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `talkie_server=trace` (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json: bool,
}

impl Cli {
    /// Fold command-line overrides into loaded settings.
    fn apply(&self, settings: &mut TalkieSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(directory) = &self.directory {
            settings.server.directory_seed = Some(directory.to_string_lossy().into_owned());
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if self.json {
            settings.logging.json = true;
        }
    }

    /// Apply overrides to `settings` and validate the result again.
    fn resolve(&self, mut settings: TalkieSettings) -> Result<TalkieSettings> {
        self.apply(&mut settings);
        talkie_settings::validate(&settings).context("Invalid command-line overrides")?;
        Ok(settings)
    }
}

fn build_bus(settings: &TalkieSettings) -> Result<Arc<dyn MessageBus>> {
    match settings.bus.backend {
        BusBackend::Local => Ok(Arc::new(LocalBus::new(settings.bus.local_capacity))),
        #[cfg(feature = "redis")]
        BusBackend::Redis => {
            let bus = talkie_server::bus::redis::RedisBus::new(
                &settings.bus.redis_url,
                settings.bus.channel.clone(),
            )
            .context("Failed to create Redis bus")?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(feature = "redis"))]
        BusBackend::Redis => {
            anyhow::bail!("bus backend `redis` requires building with the `redis` feature")
        }
    }
}

fn build_directory(settings: &TalkieSettings) -> Result<Arc<InMemoryDirectory>> {
    let Some(seed) = &settings.server.directory_seed else {
        return Ok(Arc::new(InMemoryDirectory::new()));
    };
    let directory = InMemoryDirectory::from_seed_file(Path::new(seed))
        .with_context(|| format!("Failed to load directory seed: {seed}"))?;
    Ok(Arc::new(directory))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let settings_path = args
        .settings
        .clone()
        .unwrap_or_else(talkie_settings::settings_path);
    let loaded = talkie_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings: {}", settings_path.display()))?;
    let settings = args.resolve(loaded)?;

    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_subscriber(&settings.logging.level, format);
    let metrics = talkie_server::metrics::install_recorder();

    let bus = build_bus(&settings)?;
    let directory = build_directory(&settings)?;
    let verifier = Arc::new(JwtVerifier::new(&settings.auth.jwt_secret));

    let server = HubServer::start(
        ServerConfig::from_settings(&settings),
        bus,
        Collaborators::in_memory(directory),
        verifier,
        metrics,
    )
    .await;
    let addr = server.listen().await.context("Failed to bind listener")?;
    info!(%addr, backend = ?settings.bus.backend, "talkie gateway ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown signal received");
    server.shutdown_gracefully(Some(SHUTDOWN_TIMEOUT)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_settings() {
        let cli = Cli::parse_from([
            "talkie-gateway",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--log-level",
            "debug",
            "--json",
        ]);
        let mut settings = TalkieSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.logging.level, "debug");
        assert!(settings.logging.json);
    }

    #[test]
    fn cli_without_flags_keeps_settings() {
        let cli = Cli::parse_from(["talkie-gateway"]);
        let mut settings = TalkieSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings, TalkieSettings::default());
    }

    #[test]
    fn invalid_override_fails_validation() {
        let cli = Cli::parse_from(["talkie-gateway", "--host", ""]);
        let err = cli.resolve(TalkieSettings::default()).unwrap_err();
        assert!(format!("{err:#}").contains("server.host"));
    }

    #[test]
    fn valid_override_resolves() {
        let cli = Cli::parse_from(["talkie-gateway", "--port", "0"]);
        let settings = cli.resolve(TalkieSettings::default()).unwrap();
        assert_eq!(settings.server.port, 0);
    }

    #[test]
    fn directory_seed_is_loaded() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), r#"{"conversations":{"c1":["A","B"]}}"#).unwrap();
        let mut settings = TalkieSettings::default();
        settings.server.directory_seed = Some(tmp.path().to_string_lossy().into_owned());
        assert!(build_directory(&settings).is_ok());
    }

    #[test]
    fn missing_directory_seed_fails() {
        let mut settings = TalkieSettings::default();
        settings.server.directory_seed = Some("/nonexistent/seed.json".into());
        assert!(build_directory(&settings).is_err());
    }

    #[test]
    fn local_bus_is_default() {
        let bus = build_bus(&TalkieSettings::default()).unwrap();
        assert_eq!(bus.name(), "local");
    }
}
