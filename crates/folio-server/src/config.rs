//! Command line and environment configuration

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use folio_core::Role;
use folio_logging::LogConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "folio-server", about = "Collaborative notebook sync server")]
pub struct ServerConfig {
    /// Address to listen on
    #[arg(long, env = "FOLIO_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Directory holding the database file
    #[arg(long, env = "FOLIO_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Keep everything in memory; nothing survives a restart
    #[arg(long, env = "FOLIO_IN_MEMORY")]
    pub in_memory: bool,

    /// Logging preset: development, production or testing
    #[arg(long, env = "FOLIO_LOG", default_value = "development")]
    pub log_preset: String,

    /// Directory for log files of the production preset
    #[arg(long, env = "FOLIO_LOG_DIR", default_value = "./logs")]
    pub log_dir: PathBuf,

    /// Role every identified user gets on every document
    #[arg(long, env = "FOLIO_DEFAULT_ROLE", default_value = "editor", value_parser = parse_role)]
    pub default_role: Role,
}

fn parse_role(value: &str) -> Result<Role, String> {
    Role::parse(value).map_err(|e| e.to_string())
}

impl ServerConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("folio.redb")
    }

    pub fn log_config(&self) -> anyhow::Result<LogConfig> {
        LogConfig::preset(&self.log_preset, self.log_dir.clone())
            .ok_or_else(|| anyhow::anyhow!("Unknown log preset: {}", self.log_preset))
    }
}
