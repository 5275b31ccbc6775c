//! Command-line arguments and configuration loading.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use scanbridge_core::AppConfig;

/// Bridge serial BLE observer modules to a monitoring host.
#[derive(Debug, Parser)]
#[command(name = "scanbridge", version, about)]
pub struct Cli {
    /// Configuration file (TOML or JSON).
    #[arg(short, long, env = "SCANBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Write the default configuration to the config path and exit.
    #[arg(long)]
    pub write_default_config: bool,
}

impl Cli {
    /// The configuration file to read.
    #[must_use]
    pub fn resolve_config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(AppConfig::default_path)
    }

    /// Loads and validates the configuration.
    ///
    /// A file named with `--config` (or `SCANBRIDGE_CONFIG`) must exist. A
    /// missing file at the default path is not an error: defaults and
    /// `SCANBRIDGE__*` environment overrides still apply.
    ///
    /// # Errors
    ///
    /// Returns an error if a named file is missing, or the file cannot be
    /// parsed or fails validation.
    pub fn load_config(&self) -> anyhow::Result<AppConfig> {
        let path = self.resolve_config_path();
        let config = if self.config.is_some() {
            AppConfig::load_existing(&path)
        } else {
            AppConfig::load(&path)
        }
        .with_context(|| format!("loading configuration from {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("validating configuration from {}", path.display()))?;
        Ok(config)
    }

    /// Writes [`AppConfig::default`] as TOML to the config path, refusing to
    /// overwrite an existing file. Returns the path written.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists or cannot be written.
    pub fn write_default_config_file(&self) -> anyhow::Result<PathBuf> {
        let path = self.resolve_config_path();
        if path.exists() {
            anyhow::bail!("{} already exists", path.display());
        }
        AppConfig::default()
            .save(&path)
            .with_context(|| format!("writing configuration to {}", path.display()))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_explicit_path_wins() {
        let cli = Cli::parse_from(["scanbridge", "--config", "/tmp/bridge.toml"]);
        assert_eq!(cli.resolve_config_path(), PathBuf::from("/tmp/bridge.toml"));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
rssi = "-70"

[[devices]]
serial_path = "/dev/ttyACM0"
device_id = "left"

[transport]
type = "http"
port = 9000
"#,
        )
        .unwrap();

        let cli = Cli::parse_from(["scanbridge", "--config", path.to_str().unwrap()]);
        let config = cli.load_config().unwrap();

        assert_eq!(config.rssi, "-70");
        assert_eq!(config.devices[0].resolved_id(), "left");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[[devices]]
serial_path = "/dev/ttyACM0"
enabled = false
"#,
        )
        .unwrap();

        let cli = Cli::parse_from(["scanbridge", "--config", path.to_str().unwrap()]);
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn test_named_config_must_exist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.toml");

        let cli = Cli::parse_from(["scanbridge", "--config", path.to_str().unwrap()]);
        let err = cli.load_config().unwrap_err();
        assert!(format!("{err:#}").contains("missing.toml"));
    }

    #[test]
    fn test_write_default_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etc").join("config.toml");

        let cli = Cli::parse_from([
            "scanbridge",
            "--config",
            path.to_str().unwrap(),
            "--write-default-config",
        ]);
        assert!(cli.write_default_config);
        assert_eq!(cli.write_default_config_file().unwrap(), path);

        let written = AppConfig::load_existing(&path).unwrap();
        assert_eq!(written.rssi, AppConfig::default().rssi);
        assert!(cli.load_config().is_ok());

        // A second run leaves the file alone.
        assert!(cli.write_default_config_file().is_err());
    }
}
