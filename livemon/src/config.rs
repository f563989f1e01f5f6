use std::path::PathBuf;

use envconfig::Envconfig;
use thiserror::Error;

pub const STATE_FILE_NAME: &str = "livemon.state";
pub const CONTROL_SOCKET_NAME: &str = "livemon.sock";
pub const DEV_BIND: &str = "[::1]:9843";

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "9843")]
    pub port: u16,

    // Both directories are provided by systemd (StateDirectory= and RuntimeDirectory=)
    #[envconfig(from = "STATE_DIRECTORY")]
    pub state_directory: Option<PathBuf>,

    #[envconfig(from = "RUNTIME_DIRECTORY")]
    pub runtime_directory: Option<PathBuf>,

    // Only serve metrics to peers on the tailnet
    #[envconfig(from = "TAILSCALE_ONLY", default = "false")]
    pub tailscale_only: bool,

    // Dev mode: listen on localhost:9843, keep the state file and socket in the current dir
    #[envconfig(from = "DEV_MODE", default = "false")]
    pub dev_mode: bool,
}

/// Configuration of the `livemon-poke` client.
#[derive(Envconfig, Clone, Debug)]
pub struct PokeConfig {
    #[envconfig(from = "LIVEMON_SOCKET", default = "/run/livemon/livemon.sock")]
    pub socket: PathBuf,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing {0}")]
    MissingDirectory(&'static str),
}

impl Config {
    pub fn bind(&self) -> String {
        if self.dev_mode {
            DEV_BIND.to_owned()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn state_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self
            .directory(&self.state_directory, "STATE_DIRECTORY")?
            .join(STATE_FILE_NAME))
    }

    pub fn control_socket_path(&self) -> Result<PathBuf, ConfigError> {
        Ok(self
            .directory(&self.runtime_directory, "RUNTIME_DIRECTORY")?
            .join(CONTROL_SOCKET_NAME))
    }

    fn directory(
        &self,
        configured: &Option<PathBuf>,
        name: &'static str,
    ) -> Result<PathBuf, ConfigError> {
        if self.dev_mode {
            return Ok(PathBuf::from("."));
        }
        match configured {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(dir.clone()),
            _ => Err(ConfigError::MissingDirectory(name)),
        }
    }
}
