//! Configuration manager for kube-ldap.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::AppState;
use crate::ldap::{Mapping, Mode};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const PLACEHOLDER: &str = "%s";
/// HTTP deadline when directory operations are not bounded.
const UNBOUNDED_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Directory operations run by the slowest route, `GET /auth`.
const OPERATIONS_PER_REQUEST: u32 = 3;

/// Errors found while checking the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`ldap.filter` must contain exactly one `%s`, got [{0}]")]
    Filter(String),

    #[error("`ldap.uri` is not a valid url: {0}")]
    Uri(#[from] url::ParseError),

    #[error("`ldap.uri` scheme must be `ldap` or `ldaps`, got `{0}`")]
    Scheme(String),

    #[error("`ldap.starttls` cannot be used with an `ldaps` uri")]
    StartTlsOverLdaps,

    #[error("`jwt.key` must not be empty")]
    EmptyKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Default `tracing` directive, overridden by `RUST_LOG`.
    pub log_level: String,
    /// Listening port. Depends on [`Tls::enabled`] when unset.
    pub port: Option<u16>,
    /// Export logs to an OpenTelemetry collector.
    pub otlp_endpoint: Option<String>,
    #[serde(skip_serializing)]
    pub ldap: Ldap,
    pub mapping: Mapping,
    #[serde(skip_serializing)]
    pub jwt: Jwt,
    pub tls: Tls,
    #[serde(skip_serializing)]
    pub prometheus: Prometheus,
    #[serde(skip)]
    path: PathBuf,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            port: None,
            otlp_endpoint: None,
            ldap: Ldap::default(),
            mapping: Mapping::default(),
            jwt: Jwt::default(),
            tls: Tls::default(),
            prometheus: Prometheus::default(),
            path: PathBuf::new(),
        }
    }
}

/// LDAP configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ldap {
    /// `ldap://` or `ldaps://` url of the directory.
    pub uri: String,
    /// Service account used for searches.
    pub bind_dn: String,
    pub bind_pw: String,
    /// Search base.
    pub base_dn: String,
    /// User lookup filter, `%s` being the username.
    pub filter: String,
    /// Seconds per directory operation, `0` for no limit.
    pub timeout: u64,
    pub starttls: bool,
    pub mode: Mode,
}

impl Default for Ldap {
    fn default() -> Self {
        Self {
            uri: "ldap://ldap.example.com".into(),
            bind_dn: "uid=bind,dc=example,dc=com".into(),
            bind_pw: "secret".into(),
            base_dn: "dc=example,dc=com".into(),
            filter: "(uid=%s)".into(),
            timeout: 5,
            starttls: false,
            mode: Mode::PerOperation,
        }
    }
}

impl Ldap {
    /// Operation timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Whether the connection is encrypted, either `ldaps` or StartTLS.
    pub fn is_secure(&self) -> bool {
        self.starttls || self.uri.starts_with("ldaps://")
    }
}

/// Json Web Token configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Jwt {
    /// HMAC secret.
    pub key: String,
    /// Seconds before a token expires.
    pub token_lifetime: u64,
}

impl Default for Jwt {
    fn default() -> Self {
        Self {
            key: "secret".into(),
            token_lifetime: crate::token::DEFAULT_LIFETIME,
        }
    }
}

/// HTTPS listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tls {
    pub enabled: bool,
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
}

impl Default for Tls {
    fn default() -> Self {
        Self {
            enabled: true,
            cert: "/etc/ssl/kube-ldap/cert.pem".into(),
            key: "/etc/ssl/kube-ldap/key.pem".into(),
        }
    }
}

/// Basic authentication on `/metrics`, disabled unless both are set.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prometheus {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Prometheus {
    /// Expected credentials, if any.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        Some((self.username.as_deref()?, self.password.as_deref()?))
    }
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None if self.tls.enabled => 8081,
            None => 8080,
        }
    }

    /// Deadline of a whole HTTP request.
    ///
    /// Always outlasts the directory operations of one request, so a slow
    /// directory fails with [`crate::ldap::LdapError::Timeout`] first.
    pub fn request_timeout(&self) -> Duration {
        let timeout = self.ldap.timeout();
        if timeout.is_zero() {
            return UNBOUNDED_REQUEST_TIMEOUT;
        }

        timeout
            .saturating_mul(OPERATIONS_PER_REQUEST)
            .saturating_add(Duration::from_secs(5))
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location, then applies secrets from the environment.
    pub fn read(self) -> Result<Arc<Self>, ConfigError> {
        let file_path = if self.path.is_file() {
            &self.path
        } else {
            &Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        let config = match File::open(file_path) {
            Ok(file) => match serde_yaml::from_reader::<_, Configuration>(file) {
                Ok(config) => config,
                Err(err) => self.error(err),
            },
            Err(err) => self.error(err),
        };

        let config = config.secrets(|name| std::env::var(name).ok());
        config.validate()?;

        Ok(Arc::new(config))
    }

    /// Override secrets with `LDAP_BINDPW` and `JWT_KEY`.
    fn secrets(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(password) = var("LDAP_BINDPW") {
            self.ldap.bind_pw = password;
        }
        if let Some(key) = var("JWT_KEY") {
            self.jwt.key = key;
        }
        self
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ldap.filter.matches(PLACEHOLDER).count() != 1 {
            return Err(ConfigError::Filter(self.ldap.filter.clone()));
        }

        let uri = Url::parse(&self.ldap.uri)?;
        match uri.scheme() {
            "ldap" => {},
            "ldaps" if self.ldap.starttls => return Err(ConfigError::StartTlsOverLdaps),
            "ldaps" => {},
            scheme => return Err(ConfigError::Scheme(scheme.to_owned())),
        }

        if self.jwt.key.is_empty() {
            return Err(ConfigError::EmptyKey);
        }

        Ok(())
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "cannot load `config.yaml`, using defaults");
        Self::default()
    }
}
