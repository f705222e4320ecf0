//! Layered run settings
//!
//! Sources, lowest precedence first: built-in defaults, an optional YAML
//! settings file, `XSH_*` environment variables, then command-line flags.
//!
//! ```yaml
//! hosts: ["deploy@10.0.0.1", "deploy@10.0.0.2:2222"]
//! command: "uptime"
//! parallel_limit: 4
//! timeout_secs: 60
//! key_parse_failure: skip
//! ```

use crate::credentials::{default_key_dir, CredentialResolver, KeyParseFailurePolicy};
use crate::error::{Result, XshError};
use crate::models::MAX_COMMAND_LEN;
use crate::output::{OutputFormat, OutputTarget};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "XSH";

/// Settings for one run
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub command: String,
    pub key_path: Option<PathBuf>,
    pub key_dir: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// 0 means unbounded
    #[serde(default)]
    pub parallel_limit: usize,
    pub timeout_secs: u64,
    pub dial_timeout_secs: u64,
    #[serde(default)]
    pub key_parse_failure: KeyParseFailurePolicy,
}

/// Values given on the command line; `None` leaves lower layers in place
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub hosts: Option<Vec<String>>,
    pub command: Option<String>,
    pub key_path: Option<PathBuf>,
    pub key_dir: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    pub output_format: Option<String>,
    pub parallel_limit: Option<usize>,
    pub timeout_secs: Option<u64>,
    pub dial_timeout_secs: Option<u64>,
    pub skip_bad_keys: bool,
}

impl SettingsOverrides {
    fn apply(&self, builder: ConfigBuilder<DefaultState>) -> Result<ConfigBuilder<DefaultState>> {
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.to_string_lossy().into_owned());

        let mut builder = builder
            .set_override_option("hosts", self.hosts.clone())?
            .set_override_option("command", self.command.clone())?
            .set_override_option("key_path", path(&self.key_path))?
            .set_override_option("key_dir", path(&self.key_dir))?
            .set_override_option("output_path", path(&self.output_path))?
            .set_override_option("output_format", self.output_format.clone())?
            .set_override_option("parallel_limit", self.parallel_limit.map(|v| v as i64))?
            .set_override_option("timeout_secs", self.timeout_secs.map(|v| v as i64))?
            .set_override_option(
                "dial_timeout_secs",
                self.dial_timeout_secs.map(|v| v as i64),
            )?;

        if self.skip_bad_keys {
            builder = builder.set_override("key_parse_failure", "skip")?;
        }
        Ok(builder)
    }
}

impl Settings {
    /// Load settings using the `XSH_` environment prefix
    pub fn load(file: Option<&Path>, overrides: &SettingsOverrides) -> Result<Self> {
        Self::load_with_prefix(ENV_PREFIX, file, overrides)
    }

    pub fn load_with_prefix(
        env_prefix: &str,
        file: Option<&Path>,
        overrides: &SettingsOverrides,
    ) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("timeout_secs", 120_i64)?
            .set_default("dial_timeout_secs", 10_i64)?
            .set_default("parallel_limit", 0_i64)?
            .set_default("output_format", "json")?
            .set_default("key_parse_failure", "abort")?;

        if let Some(path) = file {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("hosts"),
        );

        let settings: Settings = overrides.apply(builder)?.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check values that cannot be expressed in the types
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(XshError::InvalidConfig("command cannot be empty".to_string()));
        }

        if self.command.len() > MAX_COMMAND_LEN {
            return Err(XshError::InvalidConfig(format!(
                "command exceeds maximum length of {} bytes",
                MAX_COMMAND_LEN
            )));
        }

        if self.timeout_secs == 0 {
            return Err(XshError::InvalidConfig(
                "timeout must be at least 1 second".to_string(),
            ));
        }

        if self.dial_timeout_secs == 0 {
            return Err(XshError::InvalidConfig(
                "dial timeout must be at least 1 second".to_string(),
            ));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    /// Concurrency cap, `None` when unbounded
    pub fn parallel_limit(&self) -> Option<usize> {
        (self.parallel_limit > 0).then_some(self.parallel_limit)
    }

    pub fn resolver(&self) -> CredentialResolver {
        let dir = self.key_dir.clone().unwrap_or_else(default_key_dir);
        CredentialResolver::new(dir).with_failure_policy(self.key_parse_failure)
    }

    pub fn output_target(&self) -> OutputTarget {
        OutputTarget::from_path(self.output_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Each test uses its own prefix so the process-wide environment
    // cannot leak between tests
    fn load(prefix: &str, file: Option<&Path>, overrides: &SettingsOverrides) -> Result<Settings> {
        Settings::load_with_prefix(prefix, file, overrides)
    }

    fn with_command(command: &str) -> SettingsOverrides {
        SettingsOverrides {
            command: Some(command.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let settings = load("XSH_TEST_DEFAULTS", None, &with_command("uptime")).unwrap();
        assert!(settings.hosts.is_empty());
        assert_eq!(settings.timeout(), Duration::from_secs(120));
        assert_eq!(settings.dial_timeout(), Duration::from_secs(10));
        assert_eq!(settings.parallel_limit(), None);
        assert_eq!(settings.output_format, OutputFormat::Json);
        assert_eq!(settings.output_target(), OutputTarget::Stdout);
        assert_eq!(settings.key_parse_failure, KeyParseFailurePolicy::Abort);
    }

    #[test]
    fn test_empty_command_rejected() {
        let result = load("XSH_TEST_EMPTY", None, &SettingsOverrides::default());
        assert!(matches!(result, Err(XshError::InvalidConfig(_))));
    }

    #[test]
    fn test_command_too_long_rejected() {
        let overrides = with_command(&"a".repeat(MAX_COMMAND_LEN + 1));
        let result = load("XSH_TEST_LONG", None, &overrides);
        assert!(matches!(result, Err(XshError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let overrides = SettingsOverrides {
            timeout_secs: Some(0),
            ..with_command("uptime")
        };
        let result = load("XSH_TEST_ZERO", None, &overrides);
        assert!(matches!(result, Err(XshError::InvalidConfig(_))));
    }

    #[test]
    fn test_file_then_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("xsh.yaml");
        std::fs::write(
            &path,
            r#"
hosts: ["deploy@10.0.0.1", "deploy@10.0.0.2"]
command: "uptime"
parallel_limit: 4
timeout_secs: 30
output_format: yaml
key_parse_failure: skip
"#,
        )
        .unwrap();

        let settings = load("XSH_TEST_FILE", Some(&path), &SettingsOverrides::default()).unwrap();
        assert_eq!(settings.hosts, vec!["deploy@10.0.0.1", "deploy@10.0.0.2"]);
        assert_eq!(settings.command, "uptime");
        assert_eq!(settings.parallel_limit(), Some(4));
        assert_eq!(settings.timeout(), Duration::from_secs(30));
        assert_eq!(settings.output_format, OutputFormat::Yaml);
        assert_eq!(settings.key_parse_failure, KeyParseFailurePolicy::Skip);

        let overrides = SettingsOverrides {
            hosts: Some(vec!["root@10.9.9.9".to_string()]),
            command: Some("hostname".to_string()),
            parallel_limit: Some(0),
            output_path: Some(PathBuf::from("/tmp/report.json")),
            ..Default::default()
        };
        let settings = load("XSH_TEST_FILE", Some(&path), &overrides).unwrap();
        assert_eq!(settings.hosts, vec!["root@10.9.9.9"]);
        assert_eq!(settings.command, "hostname");
        assert_eq!(settings.parallel_limit(), None);
        assert_eq!(
            settings.output_target(),
            OutputTarget::File(PathBuf::from("/tmp/report.json"))
        );
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.yaml");
        let result = load("XSH_TEST_MISSING", Some(&missing), &with_command("uptime"));
        assert!(matches!(result, Err(XshError::Config(_))));
    }

    #[test]
    fn test_environment_layer() {
        std::env::set_var("XSH_TEST_ENV_HOSTS", "a@10.0.0.1,b@10.0.0.2");
        std::env::set_var("XSH_TEST_ENV_COMMAND", "df -h");
        std::env::set_var("XSH_TEST_ENV_PARALLEL_LIMIT", "2");

        let settings = load("XSH_TEST_ENV", None, &SettingsOverrides::default()).unwrap();
        assert_eq!(settings.hosts, vec!["a@10.0.0.1", "b@10.0.0.2"]);
        assert_eq!(settings.command, "df -h");
        assert_eq!(settings.parallel_limit(), Some(2));

        // Flags win over the environment
        let settings = load("XSH_TEST_ENV", None, &with_command("uptime")).unwrap();
        assert_eq!(settings.command, "uptime");
    }

    #[test]
    fn test_skip_bad_keys_flag() {
        let overrides = SettingsOverrides {
            skip_bad_keys: true,
            key_dir: Some(PathBuf::from("/etc/xsh/keys")),
            ..with_command("uptime")
        };
        let settings = load("XSH_TEST_SKIP", None, &overrides).unwrap();
        assert_eq!(settings.key_parse_failure, KeyParseFailurePolicy::Skip);
        assert_eq!(settings.resolver().dir(), Path::new("/etc/xsh/keys"));
    }
}
