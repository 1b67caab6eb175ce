use clap::Parser;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::streaming::StreamingSettings;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Persistence provider ("memory" or "postgres")
    #[arg(long, env = "PERSISTENCE_PROVIDER")]
    pub provider: Option<String>,

    /// Database connection string for the postgres provider
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub persistence: PersistenceConfig,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    pub provider: String,
    pub database_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamingConfig {
    pub event_ttl_secs: u64,
    pub broker_retention_secs: u64,
    pub sweep_interval_secs: u64,
    pub join_timeout_secs: u64,
    pub keep_alive_secs: u64,
}

impl StreamingConfig {
    pub fn settings(&self) -> StreamingSettings {
        StreamingSettings {
            event_ttl: Duration::from_secs(self.event_ttl_secs),
            broker_retention: Duration::from_secs(self.broker_retention_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            join_timeout: Duration::from_secs(self.join_timeout_secs),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Layered load: defaults, optional config file, `RELAY_`-prefixed
    /// environment variables, then CLI flags on top.
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("persistence.provider", "memory")?
            .set_default("persistence.database_url", "")?
            .set_default("streaming.event_ttl_secs", 3600)?
            .set_default("streaming.broker_retention_secs", 3600)?
            .set_default("streaming.sweep_interval_secs", 300)?
            .set_default("streaming.join_timeout_secs", 30)?
            .set_default("streaming.keep_alive_secs", 15)?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::new(path, FileFormat::Yaml));
        } else if Path::new("config.yaml").exists() {
            builder = builder.add_source(File::new("config.yaml", FileFormat::Yaml));
        }

        // E.g. RELAY_SERVER__PORT=8000
        builder = builder.add_source(
            Environment::with_prefix("RELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(provider) = cli.provider {
            builder = builder.set_override("persistence.provider", provider)?;
        }
        if let Some(url) = cli.database_url {
            builder = builder.set_override("persistence.database_url", url)?;
        }

        builder.build()?.try_deserialize()
    }
}
