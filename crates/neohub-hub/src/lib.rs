pub mod activation;
pub mod desktop;
pub mod error;
pub mod process;
pub mod registry;
pub mod report;
pub mod socket_server;

#[cfg(test)]
mod testing;

use registry::RegistryConfig;
use socket_server::SocketServerConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub socket_path: PathBuf,
    pub debug: bool,
    pub log_dir: Option<PathBuf>,
    pub restart_timeout: Duration,
    pub restart_poll_interval: Duration,
    pub no_fork_flag: String,
}

impl HubConfig {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            no_fork_flag: self.no_fork_flag.clone(),
            restart_timeout: self.restart_timeout,
            restart_poll_interval: self.restart_poll_interval,
        }
    }

    pub fn server_config(&self) -> SocketServerConfig {
        SocketServerConfig::new(self.socket_path.clone())
    }
}
