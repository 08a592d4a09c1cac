// Copyright (C) 2026 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Config is created by whatever hosts the registry, and handed to the scheduler and registry at
//! construction. Values come from defaults, then an optional YAML file, then `TETHER_` prefixed
//! environment variables (nested keys separated by `__`, e.g.
//! `TETHER_REGISTRY__DISCONNECTION_SECONDS=30`).

use eyre::{bail, eyre};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_DISCONNECTION_SECONDS: f64 = 15.0;
pub const DEFAULT_STALE_CONNECTION_SECONDS: f64 = 15.0;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub registry: RegistryConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on callbacks executing in worker threads at any one time.
    pub max_concurrent: usize,
    /// Worker threads are named `<prefix>-<task id>`.
    pub thread_name_prefix: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How long a connection may stay without an attached transport before it is evicted.
    pub disconnection_seconds: f64,
    /// How long a long-poll transport may be held before it is reset.
    pub stale_connection_seconds: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(8);
        Self {
            max_concurrent: (parallelism * 4).max(4),
            thread_name_prefix: "tether-task".to_string(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            disconnection_seconds: DEFAULT_DISCONNECTION_SECONDS,
            stale_connection_seconds: DEFAULT_STALE_CONNECTION_SECONDS,
        }
    }
}

impl RegistryConfig {
    pub fn disconnection_timeout(&self) -> Duration {
        seconds_to_duration(self.disconnection_seconds)
    }

    pub fn stale_connection_timeout(&self) -> Duration {
        seconds_to_duration(self.stale_connection_seconds)
    }
}

/// Out-of-range values saturate: too large becomes `Duration::MAX`, negative or NaN becomes zero.
fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(if seconds > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

fn check_seconds(name: &str, value: f64) -> Result<(), eyre::Report> {
    if value <= 0.0 || Duration::try_from_secs_f64(value).is_err() {
        bail!("{name} must be a positive, representable number of seconds, got {value}");
    }
    Ok(())
}

impl Config {
    /// Build the layered figment: defaults, then the YAML file (if any), then the environment.
    pub fn figment(config_file: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(config_file) = config_file {
            figment = figment.merge(Yaml::file(config_file));
        }
        figment.merge(Env::prefixed("TETHER_").split("__"))
    }

    /// Load and validate configuration.
    pub fn load(config_file: Option<&Path>) -> Result<Config, eyre::Report> {
        let config: Config = Self::figment(config_file).extract().map_err(|e| {
            eyre!(
                "Failed to parse configuration from {:?}: {}",
                config_file,
                e
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), eyre::Report> {
        if self.scheduler.max_concurrent == 0 {
            bail!("scheduler.max_concurrent must be at least 1");
        }
        check_seconds(
            "registry.disconnection_seconds",
            self.registry.disconnection_seconds,
        )?;
        check_seconds(
            "registry.stale_connection_seconds",
            self.registry.stale_connection_seconds,
        )?;
        Ok(())
    }
}
