//! Server options on the command line

use crate::config::{ProxyConfig, StartupPlan};
use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Default, Args)]
pub struct ServerArgs {
    /// YAML file with the same options (command-line flags take precedence)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// TLS certificate chain (PEM) for the HTTPS listener
    #[arg(long)]
    pub cert: Option<String>,

    /// TLS private key (PEM) for the HTTPS listener
    #[arg(long)]
    pub key: Option<String>,

    /// Bind address for both listeners [default: 0.0.0.0]
    #[arg(long)]
    pub bind: Option<String>,

    /// Plaintext listener port; empty disables it [default: 1080]
    #[arg(long)]
    pub port: Option<String>,

    /// TLS listener port; requires --cert and --key
    #[arg(long)]
    pub https_port: Option<String>,

    /// Basic proxy auth username; auth is enabled only together with --auth-password
    #[arg(long)]
    pub auth_username: Option<String>,

    /// Basic proxy auth password; auth is enabled only together with --auth-username
    #[arg(long)]
    pub auth_password: Option<String>,

    /// Upstream dial timeout in seconds [default: 10]
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Request head and TLS handshake timeout in seconds [default: 30]
    #[arg(long)]
    pub header_read_timeout: Option<u64>,

    /// Idle upstream connections kept per origin, 0 disables reuse [default: 16]
    #[arg(long)]
    pub max_idle_per_host: Option<usize>,

    /// Seconds an idle upstream connection stays reusable [default: 90]
    #[arg(long)]
    pub idle_timeout: Option<u64>,
}

impl ServerArgs {
    /// Convert CLI arguments to ProxyConfig, layered over the config file if one was given
    pub fn to_config(&self) -> Result<ProxyConfig> {
        let base = match &self.config {
            Some(path) => ProxyConfig::from_yaml_file(path)?,
            None => ProxyConfig::default(),
        };

        let overrides = ProxyConfig {
            cert: self.cert.clone(),
            key: self.key.clone(),
            bind: self.bind.clone(),
            port: self.port.clone(),
            https_port: self.https_port.clone(),
            auth_username: self.auth_username.clone(),
            auth_password: self.auth_password.clone(),
            connect_timeout: self.connect_timeout,
            header_read_timeout: self.header_read_timeout,
            max_idle_per_host: self.max_idle_per_host,
            idle_timeout: self.idle_timeout,
        };

        Ok(base.merge(overrides))
    }

    /// Resolve the options into a startup plan
    pub fn plan(&self) -> Result<StartupPlan> {
        let config = self.to_config()?;
        let plan = config.resolve().context("Invalid configuration")?;

        for listener in &plan.listeners {
            debug!("Planned {} listener on {}", listener.transport.name(), listener.address());
        }
        debug!("Proxy authentication: {}", if plan.auth.is_some() { "enabled" } else { "disabled" });

        Ok(plan)
    }
}
