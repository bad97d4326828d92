//! LDAP support.
//!
//! Directory records are fetched through [`Client`], credentials checked by
//! [`Authenticator`] and records turned into Kubernetes identities by
//! [`Mapping`].

mod authenticator;
mod client;
mod mapping;
#[cfg(test)]
pub(crate) mod mock;

use std::collections::BTreeMap;

use ldap3::SearchEntry;
use serde::{Deserialize, Serialize};

pub use authenticator::Authenticator;
pub use client::{Client, Connection, Connector, Ldap3Connector, Mode};
pub use mapping::{ExternalIdentity, Mapping};

pub type Result<T> = std::result::Result<T, LdapError>;

/// Errors raised while talking to the directory.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LdapError {
    #[error("cannot reach directory: {0}")]
    Connection(String),

    #[error("directory returned status {code}: {message}")]
    Status { code: u32, message: String },

    #[error("directory operation timed out")]
    Timeout,

    #[error("secure session not established")]
    TlsRequired,

    #[error("no object found with filter [{0}]")]
    NotFound(String),

    #[error("invalid dn [{0}]")]
    InvalidDn(String),
}

impl LdapError {
    /// Whether the search matched nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, LdapError::NotFound(_))
    }

    /// Whether the failure happened on the wire (transport, TLS, timeout or
    /// non-zero result status).
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            LdapError::Connection(_)
                | LdapError::Status { .. }
                | LdapError::Timeout
                | LdapError::TlsRequired
        )
    }
}

impl From<ldap3::LdapError> for LdapError {
    fn from(err: ldap3::LdapError) -> Self {
        match err {
            ldap3::LdapError::LdapResult { result } => LdapError::Status {
                code: result.rc,
                message: result.text,
            },
            err => LdapError::Connection(err.to_string()),
        }
    }
}

/// Value of a directory attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Single(String),
    Multiple(Vec<String>),
}

impl AttributeValue {
    /// First value held by the attribute.
    pub fn first(&self) -> Option<&str> {
        match self {
            AttributeValue::Single(value) => Some(value),
            AttributeValue::Multiple(values) => values.first().map(String::as_str),
        }
    }

    /// Every value, a single value being a one-element list.
    pub fn values(&self) -> &[String] {
        match self {
            AttributeValue::Single(value) => std::slice::from_ref(value),
            AttributeValue::Multiple(values) => values,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Single(value.to_owned())
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(mut values: Vec<String>) -> Self {
        if values.len() == 1 {
            AttributeValue::Single(values.remove(0))
        } else {
            AttributeValue::Multiple(values)
        }
    }
}

/// Record returned by a directory search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entry {
    pub dn: String,
    pub attrs: BTreeMap<String, AttributeValue>,
}

impl Entry {
    /// Create an empty [`Entry`] located at `dn`.
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Set an attribute.
    pub fn attr(
        mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    /// Read an attribute.
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.attrs.get(name)
    }
}

impl From<SearchEntry> for Entry {
    fn from(entry: SearchEntry) -> Self {
        Self {
            dn: entry.dn,
            attrs: entry
                .attrs
                .into_iter()
                .map(|(name, values)| (name, values.into()))
                .collect(),
        }
    }
}

/// Extract the value of the leading RDN, e.g. `cn=test,dc=example,dc=com`
/// gives `test`.
///
/// Escaped characters (`\,`, `\=`) are not interpreted.
pub fn canonicalize_dn(dn: &str) -> Result<String> {
    let rdn = dn.split_once(',').map_or(dn, |(rdn, _)| rdn);

    match rdn.split_once('=') {
        Some((_, value)) => Ok(value.to_owned()),
        None => Err(LdapError::InvalidDn(dn.to_owned())),
    }
}

/// Substitute the first `%s` of `template` with `value`, escaped as an
/// RFC 4515 assertion value.
pub fn format_filter(template: &str, value: &str) -> String {
    template.replacen("%s", &ldap3::ldap_escape(value), 1)
}
