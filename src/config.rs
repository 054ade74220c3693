//! Runtime configuration shared between the CLI and the proxy core.

use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: String,
    pub upstream_addr: String,
    pub pid_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl ProxyConfig {
    pub fn new(listen_addr: impl Into<String>, upstream_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            upstream_addr: upstream_addr.into(),
            pid_file: None,
            log_file: None,
        }
    }
}

/// Writes the current process id to `path`, truncating any existing file.
pub fn write_pid_file(path: &Path) -> Result<()> {
    std::fs::write(path, format!("{}\n", std::process::id()))?;
    Ok(())
}
