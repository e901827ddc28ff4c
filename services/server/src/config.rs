//! Environment-driven server configuration.

use std::path::PathBuf;

use tracing::info;

pub const DATA_FILE_ENV: &str = "SISOP2_SERVER_DATA_FILE";
pub const DEFAULT_DATA_FILE: &str = ".sisop2_server_data";
pub const GROUP_FILE_ENV: &str = "SISOP2_SERVER_GROUP_FILE";
pub const GROUP_ENV: &str = "SISOP2_SERVER_GROUP";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Where the profile snapshot is persisted.
    pub data_file: PathBuf,
    /// Replica-group settings.  Read and reported, but this build runs a
    /// single replica and does not act on them.
    pub group_file: Option<PathBuf>,
    pub group: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let data_file = std::env::var_os(DATA_FILE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_FILE));
        let group_file = std::env::var_os(GROUP_FILE_ENV).map(PathBuf::from);
        let group = std::env::var(GROUP_ENV).ok();

        if group_file.is_some() || group.is_some() {
            info!("replica-group settings present; this build runs a single replica");
        }

        ServerConfig { data_file, group_file, group }
    }
}
