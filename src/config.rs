use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::core::DEFAULT_AREA_THRESHOLD;

pub const DEFAULT_PORT: u16 = 9034;

/// Config file picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "hulld.toml";

/// Connection dispatch strategy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One thread multiplexing every connection.
    Reactor,
    /// One thread per connection.
    #[default]
    Proactor,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Reactor => f.write_str("reactor"),
            Mode::Proactor => f.write_str("proactor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub host: IpAddr,
    pub port: u16,
    pub mode: Mode,
    pub area_threshold: f64,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            mode: Mode::default(),
            area_threshold: DEFAULT_AREA_THRESHOLD,
            verbose: false,
            json_logs: false,
        }
    }
}

impl AppConfig {
    /// Layer defaults, the config file, `HULLD_*` variables and finally the
    /// command line overrides. `overrides` should only serialize the fields
    /// that were actually given.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> anyhow::Result<Self> {
        let file = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("HULLD_"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !self.area_threshold.is_finite() || self.area_threshold < 0.0 {
            anyhow::bail!(
                "area_threshold must be a non-negative number, got {}",
                self.area_threshold
            );
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<Mode>,
    }

    fn missing_file() -> PathBuf {
        PathBuf::from("/nonexistent/hulld-test.toml")
    }

    #[test]
    fn defaults_without_file() {
        let config = AppConfig::new(Some(missing_file().as_path()), None::<&Overrides>).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.bind_addr(), "0.0.0.0:9034".parse().unwrap());
    }

    #[test]
    fn file_then_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port = 7000\nmode = \"reactor\"\narea_threshold = 50.0\nhost = \"127.0.0.1\""
        )
        .unwrap();

        let config = AppConfig::new(Some(file.path()), None::<&Overrides>).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.mode, Mode::Reactor);
        assert_eq!(config.area_threshold, 50.0);
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::LOCALHOST));

        let overrides = Overrides {
            port: Some(7001),
            mode: None,
        };
        let config = AppConfig::new(Some(file.path()), Some(&overrides)).unwrap();
        assert_eq!(config.port, 7001);
        assert_eq!(config.mode, Mode::Reactor, "unset overrides keep file values");
    }

    #[test]
    fn rejects_negative_threshold() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "area_threshold = -1.0").unwrap();

        assert!(AppConfig::new(Some(file.path()), None::<&Overrides>).is_err());
    }
}
