use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use models::{ProvisionConfig, StorePaths, DEFAULT_CONFIG_FILE_NAME};
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "certprov", about = "Obtain and install this node's TLS identity")]
pub struct Cli {
    /// Node base directory; stores live under <DIR>/certificates
    #[arg(long, value_name = "DIR")]
    pub base_directory: PathBuf,

    /// Configuration file (defaults to <DIR>/certprov.toml)
    #[arg(long, value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Override poll_interval_secs from the config file
    #[arg(long, value_name = "SECS")]
    pub poll_interval_secs: Option<u64>,

    /// Override poll_timeout_secs from the config file
    #[arg(long, value_name = "SECS")]
    pub poll_timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the provisioning workflow (default)
    Provision,
    /// Report provisioning progress from local state
    Status,
    /// Print fingerprints of the installed chain and trust anchors
    Fingerprints,
}

/// Everything a command needs, validated.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub base_directory: PathBuf,
    pub config: ProvisionConfig,
    pub paths: StorePaths,
}

impl Cli {
    /// Parse arguments without exiting the process on failure.
    pub fn parse_args<I, T>(args: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(args)
    }

    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Provision)
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_file
            .clone()
            .unwrap_or_else(|| self.base_directory.join(DEFAULT_CONFIG_FILE_NAME))
    }

    pub fn resolve(&self) -> Result<ResolvedConfig> {
        if !self.base_directory.is_dir() {
            bail!(
                "base directory {} does not exist or is not a directory",
                self.base_directory.display()
            );
        }
        let config_path = self.config_path();
        let mut config = ProvisionConfig::from_file(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        if let Some(secs) = self.poll_interval_secs {
            config.poll_interval_secs = secs;
        }
        if let Some(secs) = self.poll_timeout_secs {
            config.poll_timeout_secs = Some(secs);
        }
        config.validate()?;
        Ok(ResolvedConfig {
            paths: StorePaths::under(&self.base_directory),
            base_directory: self.base_directory.clone(),
            config,
        })
    }
}
