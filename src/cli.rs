//! CLI interface for xsh

use crate::logging::{init_logging, LogConfig};
use crate::output::OutputTarget;
use crate::plan::Plan;
use crate::settings::{Settings, SettingsOverrides};
use crate::transport::ssh::Ssh2Transport;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// xsh - run one shell command on many hosts over SSH
#[derive(Parser, Debug)]
#[command(name = "xsh")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Multi-host ssh command runner", long_about = None)]
pub struct Cli {
    /// Hosts to connect to, as user@host[:port] (comma separated or repeated)
    #[arg(long, value_delimiter = ',')]
    pub hosts: Vec<String>,

    /// Command to execute on every host
    #[arg(short, long)]
    pub command: Option<String>,

    /// Private key file; scans the key directory when omitted
    #[arg(short, long)]
    pub key: Option<PathBuf>,

    /// Directory scanned for private keys (default: ~/.ssh)
    #[arg(long)]
    pub key_dir: Option<PathBuf>,

    /// Skip unparsable files in the key directory instead of failing
    #[arg(long)]
    pub skip_bad_keys: bool,

    /// Write the report to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Report format (json or yaml)
    #[arg(long)]
    pub format: Option<String>,

    /// Limit concurrent command execution (0 = unlimited)
    #[arg(short, long)]
    pub parallel_limit: Option<usize>,

    /// Seconds before in-flight commands are interrupted
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Seconds allowed to connect to each host
    #[arg(long)]
    pub dial_timeout: Option<u64>,

    /// YAML settings file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "warn")]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        let config = LogConfig {
            level: self.log_level.as_str().into(),
            format: self.log_format.as_str().into(),
        };

        init_logging(&config)
    }

    /// Flag values layered over file and environment settings
    pub fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            hosts: (!self.hosts.is_empty()).then(|| self.hosts.clone()),
            command: self.command.clone(),
            key_path: self.key.clone(),
            key_dir: self.key_dir.clone(),
            output_path: self.output.clone(),
            output_format: self.format.clone(),
            parallel_limit: self.parallel_limit,
            timeout_secs: self.timeout,
            dial_timeout_secs: self.dial_timeout,
            skip_bad_keys: self.skip_bad_keys,
        }
    }

    /// Execute the run described by the CLI arguments
    pub async fn execute(&self) -> anyhow::Result<()> {
        let settings = Settings::load(self.config.as_deref(), &self.overrides())?;
        info!(
            "Running '{}' on {} host(s)",
            settings.command,
            settings.hosts.len()
        );

        let mut plan = Plan::from_settings(&settings, Arc::new(Ssh2Transport::new()));
        plan.open().await?;

        let deadline = plan.arm_deadline(settings.timeout());
        let abort = {
            let stop = plan.stop_signal();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() && stop.fire() {
                    warn!("Interrupted, closing sessions");
                }
            })
        };

        let results = plan.execute().await;

        if let Some(teardown) = plan.shutdown().await {
            if !teardown.errors.is_empty() {
                warn!("{} session(s) failed to close cleanly", teardown.errors.len());
            }
        }
        deadline.abort();
        abort.abort();

        let report = results?.snapshot();
        info!(
            "{} succeeded, {} failed",
            report.successes.len(),
            report.failures.len()
        );

        if let Err(e) = plan.write_report(&report) {
            error!("Failed to write report: {}", e);
            // Never lose the results: fall back to stdout
            if let OutputTarget::File(_) = plan.output_target() {
                OutputTarget::Stdout.write(&report, settings.output_format)?;
            }
            return Err(e.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_args() {
        let cli = Cli::try_parse_from([
            "xsh",
            "--hosts",
            "a@10.0.0.1,b@10.0.0.2",
            "--command",
            "uptime",
        ])
        .unwrap();

        assert_eq!(cli.hosts, vec!["a@10.0.0.1", "b@10.0.0.2"]);
        assert_eq!(cli.command.as_deref(), Some("uptime"));
        assert_eq!(cli.log_level, "warn");
        assert!(cli.parallel_limit.is_none());
    }

    #[test]
    fn test_parse_repeated_hosts_and_limits() {
        let cli = Cli::try_parse_from([
            "xsh",
            "--hosts",
            "a@10.0.0.1",
            "--hosts",
            "b@10.0.0.2",
            "-c",
            "df -h",
            "-p",
            "2",
            "-t",
            "30",
            "--skip-bad-keys",
            "-o",
            "out.json",
        ])
        .unwrap();

        assert_eq!(cli.hosts.len(), 2);
        assert_eq!(cli.parallel_limit, Some(2));
        assert_eq!(cli.timeout, Some(30));
        assert!(cli.skip_bad_keys);

        let overrides = cli.overrides();
        assert_eq!(overrides.hosts.as_ref().map(Vec::len), Some(2));
        assert_eq!(overrides.output_path, Some(PathBuf::from("out.json")));
        assert!(overrides.skip_bad_keys);
    }

    #[test]
    fn test_no_hosts_flag_leaves_lower_layers() {
        let cli = Cli::try_parse_from(["xsh", "--command", "uptime"]).unwrap();
        assert!(cli.overrides().hosts.is_none());
    }

    #[test]
    fn test_rejects_non_numeric_limit() {
        assert!(Cli::try_parse_from(["xsh", "--parallel-limit", "many"]).is_err());
    }
}
