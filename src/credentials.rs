//! Credential resolution for SSH public-key authentication
//!
//! A run authenticates with either one explicit private key file or every
//! private key found in a credential directory (by default `$HOME/.ssh`).
//! Directory scans skip known non-key artifacts according to [`ScanRules`]
//! and handle unparsable files according to [`KeyParseFailurePolicy`].
//!
//! # Example
//!
//! ```no_run
//! use xsh::credentials::{CredentialResolver, KeyParseFailurePolicy};
//!
//! let resolver = CredentialResolver::new("/home/deploy/.ssh")
//!     .with_failure_policy(KeyParseFailurePolicy::Skip);
//! let credentials = resolver.resolve(None)?;
//! println!("Loaded {} keys", credentials.len());
//! # Ok::<(), xsh::error::XshError>(())
//! ```

use crate::error::{Result, XshError};
use openssl::pkey::PKey;
use secrecy::{ExposeSecret, Secret, SecretString};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const ENCRYPTED_KEY: &str = "passphrase-protected keys are not supported";

/// What to do when a scanned file does not parse as a private key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyParseFailurePolicy {
    /// Fail the whole resolution
    #[default]
    Abort,
    /// Log a warning and continue with the remaining files
    Skip,
}

/// Entries of the credential directory that are never treated as keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRules {
    pub ignored_names: Vec<String>,
    pub ignored_suffixes: Vec<String>,
}

impl Default for ScanRules {
    fn default() -> Self {
        Self {
            ignored_names: vec![
                "config".to_string(),
                "known_hosts".to_string(),
                "known_hosts.old".to_string(),
            ],
            ignored_suffixes: vec![".pub".to_string()],
        }
    }
}

impl ScanRules {
    pub fn is_ignored(&self, file_name: &str) -> bool {
        self.ignored_names.iter().any(|n| n == file_name)
            || self
                .ignored_suffixes
                .iter()
                .any(|suffix| file_name.ends_with(suffix.as_str()))
    }
}

/// Private key encodings recognised by the parser
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    OpenSsh,
    Rsa,
    Ec,
    Dsa,
    Pkcs8,
}

impl KeyFormat {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "OPENSSH PRIVATE KEY" => Some(KeyFormat::OpenSsh),
            "RSA PRIVATE KEY" => Some(KeyFormat::Rsa),
            "EC PRIVATE KEY" => Some(KeyFormat::Ec),
            "DSA PRIVATE KEY" => Some(KeyFormat::Dsa),
            "PRIVATE KEY" => Some(KeyFormat::Pkcs8),
            _ => None,
        }
    }
}

/// A parsed private key usable for authentication
#[derive(Debug)]
pub struct Credential {
    source: PathBuf,
    format: KeyFormat,
    pem: SecretString,
}

impl Credential {
    /// Decode PEM-armoured private key material read from `source`.
    ///
    /// OpenSSH keys are decoded with `russh-keys`; PKCS#1, SEC1, DSA and
    /// PKCS#8 keys with OpenSSL. Passphrase-protected keys are rejected.
    pub fn parse(source: impl Into<PathBuf>, data: &[u8]) -> Result<Self> {
        let source = source.into();
        let fail = |reason: String| XshError::KeyParse {
            path: source.clone(),
            reason,
        };

        let text = std::str::from_utf8(data)
            .map_err(|_| fail("not valid UTF-8".to_string()))?
            .trim();

        let label = text
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("-----BEGIN "))
            .and_then(|rest| rest.strip_suffix("-----"))
            .ok_or_else(|| fail("missing PEM header".to_string()))?;

        if label.contains("ENCRYPTED") || text.contains("Proc-Type: 4,ENCRYPTED") {
            return Err(fail(ENCRYPTED_KEY.to_string()));
        }
        let format = KeyFormat::from_label(label)
            .ok_or_else(|| fail(format!("unsupported key type '{}'", label)))?;

        match format {
            KeyFormat::OpenSsh => {
                russh_keys::decode_secret_key(text, None).map_err(|e| match e {
                    russh_keys::Error::KeyIsEncrypted => fail(ENCRYPTED_KEY.to_string()),
                    e => fail(e.to_string()),
                })?;
            }
            // An empty passphrase keeps OpenSSL from prompting on the terminal
            _ => {
                PKey::private_key_from_pem_passphrase(text.as_bytes(), b"")
                    .map_err(|e| fail(e.to_string()))?;
            }
        }

        Ok(Self {
            source,
            format,
            pem: Secret::new(text.to_string()),
        })
    }

    /// Path the key was loaded from
    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn format(&self) -> KeyFormat {
        self.format
    }

    /// PEM text of the private key
    pub fn pem(&self) -> &str {
        self.pem.expose_secret()
    }
}

/// Turns a key path or a credential directory into a set of credentials
#[derive(Debug, Clone)]
pub struct CredentialResolver {
    dir: PathBuf,
    rules: ScanRules,
    on_parse_failure: KeyParseFailurePolicy,
}

impl CredentialResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            rules: ScanRules::default(),
            on_parse_failure: KeyParseFailurePolicy::default(),
        }
    }

    /// Resolver for `$HOME/.ssh`
    pub fn from_home() -> Self {
        Self::new(default_key_dir())
    }

    pub fn with_rules(mut self, rules: ScanRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_failure_policy(mut self, policy: KeyParseFailurePolicy) -> Self {
        self.on_parse_failure = policy;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Resolve credentials from `explicit` if given, else scan the directory.
    ///
    /// # Errors
    ///
    /// * `XshError::KeyRead` / `XshError::KeyParse` - explicit key unusable,
    ///   or a scanned key unusable under [`KeyParseFailurePolicy::Abort`]
    /// * `XshError::NoCredentialsFound` - scan yielded no keys
    pub fn resolve(&self, explicit: Option<&Path>) -> Result<Vec<Credential>> {
        if let Some(path) = explicit {
            debug!("Loading explicit key: {:?}", path);
            return Ok(vec![load_key(path)?]);
        }

        self.scan()
    }

    fn scan(&self) -> Result<Vec<Credential>> {
        debug!("Scanning credential directory: {:?}", self.dir);

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(XshError::NoCredentialsFound {
                    dir: self.dir.clone(),
                })
            }
            Err(e) => return Err(XshError::Io(e)),
        };

        let mut credentials = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if self.rules.is_ignored(&name) {
                debug!("Skipping non-key entry: {}", name);
                continue;
            }
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            match load_key(&path) {
                Ok(credential) => credentials.push(credential),
                Err(e) => match self.on_parse_failure {
                    KeyParseFailurePolicy::Abort => return Err(e),
                    KeyParseFailurePolicy::Skip => warn!("Skipping unusable key: {}", e),
                },
            }
        }

        if credentials.is_empty() {
            return Err(XshError::NoCredentialsFound {
                dir: self.dir.clone(),
            });
        }

        info!(
            "Loaded {} key(s) from {}",
            credentials.len(),
            self.dir.display()
        );
        Ok(credentials)
    }
}

fn load_key(path: &Path) -> Result<Credential> {
    let data = fs::read(path).map_err(|source| XshError::KeyRead {
        path: path.to_path_buf(),
        source,
    })?;
    Credential::parse(path, &data)
}

/// `$HOME/.ssh`, or `.ssh` relative to the working directory without HOME
pub fn default_key_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".ssh")
}
