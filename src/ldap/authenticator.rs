//! Credentials verification against the directory.

use super::{Client, Entry, Result, format_filter};

/// RFC 4511 selector asking for no attributes, only the entry DN.
const NO_ATTRIBUTES: &str = "1.1";

/// Check user credentials and fetch their attributes.
pub struct Authenticator {
    client: Client,
    filter: String,
}

impl Authenticator {
    /// Create a new [`Authenticator`].
    ///
    /// `filter` must contain one `%s`, replaced by the username.
    pub fn new(client: Client, filter: impl Into<String>) -> Self {
        Self {
            client,
            filter: filter.into(),
        }
    }

    /// Authenticate user on LDAP.
    ///
    /// Any failure resolves to `false`, the reason is only logged.
    pub async fn authenticate(&self, username: &str, password: &str) -> bool {
        // some servers accept an empty password as an anonymous bind.
        if password.is_empty() {
            tracing::info!(username, "empty password");
            metrics::counter!("ldap_authentications_total", "result" => "rejected").increment(1);
            return false;
        }

        let filter = format_filter(&self.filter, username);
        let outcome = match self.client.search(&filter, Some(&[NO_ATTRIBUTES.to_owned()][..]), None).await {
            Ok(user) => self.client.bind(&user.dn, password).await,
            Err(err) => Err(err),
        };

        let (authenticated, result) = match outcome {
            Ok(true) => (true, "success"),
            Ok(false) => {
                tracing::info!(username, "invalid credentials");
                (false, "rejected")
            },
            Err(err) if err.is_not_found() => {
                tracing::info!(username, %err, "unknown user");
                (false, "rejected")
            },
            Err(err) => {
                tracing::warn!(username, %err, "authentication failed");
                (false, "error")
            },
        };

        metrics::counter!("ldap_authentications_total", "result" => result).increment(1);
        authenticated
    }

    /// Get attributes of user from LDAP.
    ///
    /// Only `attributes` are kept, even if the directory sent more.
    pub async fn get_attributes(
        &self,
        username: &str,
        attributes: &[String],
    ) -> Result<Entry> {
        let filter = format_filter(&self.filter, username);
        let mut entry = self.client.search(&filter, Some(attributes), None).await?;

        entry.attrs.retain(|name, _| attributes.contains(name));
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::ldap::mock::{Directory, MockConnector, SERVICE_DN, SERVICE_PASSWORD};
    use crate::ldap::{AttributeValue, LdapError};

    fn authenticator(directory: &Directory) -> Authenticator {
        let client = Client::new(
            Arc::new(MockConnector::new(directory.clone())),
            "dc=example,dc=com",
            SERVICE_DN,
            SERVICE_PASSWORD,
        );
        Authenticator::new(client, "(uid=%s)")
    }

    #[tokio::test]
    async fn test_authenticate() {
        let directory = Directory::with_john_doe();

        assert!(authenticator(&directory).authenticate("john.doe", "secret").await);

        let state = directory.state();
        assert_eq!(state.searched_filters, ["(uid=john.doe)"]);
        assert_eq!(state.searched_attributes, [["1.1"]]);
        assert_eq!(
            state.bound_dns,
            [SERVICE_DN, "uid=john.doe,dc=example,dc=com"]
        );
        assert_eq!(state.unbinds, 2);
    }

    #[tokio::test]
    async fn test_authenticate_wrong_password() {
        let directory = Directory::with_john_doe();
        assert!(!authenticator(&directory).authenticate("john.doe", "wrong").await);
    }

    #[tokio::test]
    async fn test_authenticate_empty_password() {
        let directory = Directory::with_john_doe();
        let authenticator = authenticator(&directory);

        for username in ["john.doe", "", "ghost"] {
            assert!(!authenticator.authenticate(username, "").await);
        }

        let state = directory.state();
        assert_eq!(state.connects, 0);
        assert_eq!(state.binds, 0);
        assert_eq!(state.searches, 0);
    }

    #[tokio::test]
    async fn test_authenticate_unknown_user() {
        let directory = Directory::with_john_doe();

        assert!(!authenticator(&directory).authenticate("ghost", "secret").await);
        // no user bind attempted.
        assert_eq!(directory.state().bound_dns, [SERVICE_DN]);
    }

    #[tokio::test]
    async fn test_authenticate_unreachable() {
        let directory = Directory::with_john_doe();
        directory.update(|state| state.unreachable = true);

        assert!(!authenticator(&directory).authenticate("john.doe", "secret").await);
    }

    #[tokio::test]
    async fn test_authenticate_escapes_username() {
        let directory = Directory::with_john_doe();

        assert!(!authenticator(&directory).authenticate("*", "secret").await);
        assert_eq!(directory.state().searched_filters, [r"(uid=\2a)"]);
    }

    #[tokio::test]
    async fn test_get_attributes() {
        let directory = Directory::with_john_doe();
        let attributes = ["uid".to_owned(), "memberOf".to_owned()];

        let entry = authenticator(&directory)
            .get_attributes("john.doe", &attributes)
            .await
            .unwrap();

        // `mail`, `uidNumber` and `gidNumber` are dropped.
        assert_eq!(entry.attrs.len(), 2);
        assert_eq!(entry.get("uid"), Some(&AttributeValue::from("john.doe")));
        assert_eq!(
            entry.get("memberOf"),
            Some(&AttributeValue::from("cn=test,dc=example,dc=com"))
        );
    }

    #[tokio::test]
    async fn test_get_attributes_not_found() {
        let directory = Directory::with_john_doe();

        assert_eq!(
            authenticator(&directory)
                .get_attributes("ghost", &["uid".to_owned()])
                .await,
            Err(LdapError::NotFound("(uid=ghost)".into()))
        );
    }

    #[tokio::test]
    async fn test_get_attributes_connection_error() {
        let directory = Directory::with_john_doe();
        directory.update(|state| state.search_status = Some(1));

        let err = authenticator(&directory)
            .get_attributes("john.doe", &["uid".to_owned()])
            .await
            .unwrap_err();
        assert!(err.is_connection());
    }
}
