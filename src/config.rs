use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the service.
#[derive(Parser, Debug, Default)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Identity service GraphQL endpoint.
    #[arg(long)]
    pub identity_url: Option<String>,
    /// Redis URL for the broadcast broker; omit for in-process delivery.
    #[arg(long)]
    pub redis_url: Option<String>,
}

/// Runtime configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    /// Base directory holding the SQLite database.
    pub data_dir: PathBuf,
    /// Identity service GraphQL endpoint.
    pub identity_url: String,
    /// Broadcast broker URL; `None` selects the local-only hub.
    pub redis_url: Option<String>,
    /// Whether verbose logging is enabled.
    pub logging_enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    identity: FileIdentity,
    #[serde(default)]
    broker: FileBroker,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileIdentity {
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize, Default)]
struct FileBroker {
    #[serde(default)]
    url: Option<String>,
}

fn default_port() -> u16 {
    4002
}

fn default_logging() -> bool {
    true
}

fn default_identity_url() -> String {
    "http://localhost:4001/graphql".to_string()
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file
    /// and defaults, in that precedence order.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut port = default_port();
        let mut logging = default_logging();
        let mut identity_url = default_identity_url();
        let mut redis_url: Option<String> = None;

        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("CHAT_SERVICE_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/chat_service.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents).context("invalid config file")?;
            port = file_cfg.server.port;
            logging = file_cfg.logging.enabled;
            if let Some(url) = file_cfg.identity.url {
                identity_url = url;
            }
            redis_url = file_cfg.broker.url;
        }

        // environment overrides
        if let Ok(p) = std::env::var("CHAT_SERVICE_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("CHAT_SERVICE_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                logging = l;
            }
        }
        if let Ok(url) = std::env::var("USER_SERVICE_URL") {
            identity_url = url;
        }
        if let Ok(url) = std::env::var("REDIS_URL") {
            redis_url = Some(url);
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            logging = l;
        }
        if let Some(url) = &cli.identity_url {
            identity_url = url.clone();
        }
        if let Some(url) = &cli.redis_url {
            redis_url = Some(url.clone());
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }

        let bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        Ok(Self {
            bind,
            data_dir,
            identity_url,
            redis_url,
            logging_enabled: logging,
        })
    }

    /// Location of the SQLite database file.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("chat.db")
    }
}

/// Determine the default data directory for the service.
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        let mut p = PathBuf::from(home);
        p.push(".local/share/chat-service");
        p
    } else {
        PathBuf::from("./chat_service_data")
    }
}
