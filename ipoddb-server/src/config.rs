//! Server configuration

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Mount point of the device
    pub mountpoint: PathBuf,
    /// TCP address for client connections
    pub bind_addr: String,
    /// Queries still running after this are aborted
    pub query_timeout: Duration,
    /// Write pending changes to the device before exiting
    pub write_on_shutdown: bool,
}
