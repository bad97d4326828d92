//! Kubernetes <=> LDAP attribute mapping.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{AttributeValue, Entry, Result, canonicalize_dn};

/// Identity handed to Kubernetes, i.e. the `user` of a `TokenReview`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIdentity {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Group names, never distinguished names.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Always lists, as Kubernetes expects `map[string][]string`.
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Names of the LDAP attributes backing each identity field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Mapping {
    /// Attribute name for the Kubernetes username.
    pub username: String,
    /// Attribute name for the Kubernetes uid.
    pub uid: String,
    /// Attribute name for the Kubernetes groups.
    pub groups: String,
    /// Attributes copied as-is into `extra`.
    pub extra_fields: Vec<String>,
}

impl Default for Mapping {
    fn default() -> Self {
        Self {
            username: "uid".into(),
            uid: "uid".into(),
            groups: "memberOf".into(),
            extra_fields: Vec::new(),
        }
    }
}

impl Mapping {
    /// Create a new [`Mapping`].
    pub fn new(
        username: impl Into<String>,
        uid: impl Into<String>,
        groups: impl Into<String>,
        extra_fields: Vec<String>,
    ) -> Self {
        Self {
            username: username.into(),
            uid: uid.into(),
            groups: groups.into(),
            extra_fields,
        }
    }

    /// Every LDAP attribute needed to build an [`ExternalIdentity`].
    pub fn ldap_attributes(&self) -> Vec<String> {
        [&self.username, &self.uid, &self.groups]
            .into_iter()
            .chain(&self.extra_fields)
            .cloned()
            .collect()
    }

    /// Convert an LDAP entry into an [`ExternalIdentity`].
    ///
    /// Fails if a group is not a valid DN.
    pub fn to_external(&self, entry: &Entry) -> Result<ExternalIdentity> {
        let first = |name: &str| {
            entry
                .get(name)
                .and_then(AttributeValue::first)
                .unwrap_or_default()
                .to_owned()
        };

        let groups = entry
            .get(&self.groups)
            .map(AttributeValue::values)
            .unwrap_or_default()
            .iter()
            .map(|group| canonicalize_dn(group))
            .collect::<Result<Vec<_>>>()?;

        let extra = self
            .extra_fields
            .iter()
            .filter_map(|field| Some((field.clone(), entry.get(field)?.values().to_vec())))
            .collect();

        Ok(ExternalIdentity {
            username: first(&self.username),
            uid: first(&self.uid),
            groups,
            extra,
        })
    }
}
