// Copyright PingCAP Inc. 2025.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; version 2 of the License.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP listen address, e.g. "0.0.0.0:80"
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Peer shard base URLs, e.g. "http://10.0.0.2:80". Command line
    /// arguments extend this list.
    #[serde(default)]
    pub peers: Vec<String>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one subdirectory per repo.
    #[serde(default = "default_root")]
    pub root: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Poll interval for pipeline waiters, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bound on how long a pipeline read blocks for its commit, in seconds.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            peers: Vec::new(),
            storage: StorageConfig::default(),
            runner: RunnerConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            wait_timeout_secs: default_wait_timeout_secs(),
        }
    }
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults so a
    /// shard can start with nothing but its command line.
    pub fn from_path(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(toml::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_root() -> String {
    "./shard-data".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_wait_timeout_secs() -> u64 {
    60
}
