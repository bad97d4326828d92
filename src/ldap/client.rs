//! Directory client enforcing bind, operate, release on every call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{Ldap as Ldap3, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use super::{Entry, LdapError, Result};

/// A single session with the directory.
///
/// Implementations report any non-zero result code as
/// [`LdapError::Status`] and transport failures as
/// [`LdapError::Connection`].
#[async_trait]
pub trait Connection: Send {
    /// Whether the session runs over TLS.
    fn is_secure(&self) -> bool;

    /// Authenticate the session as `dn`.
    async fn bind(&mut self, dn: &str, password: &str) -> Result<()>;

    /// Subtree search under `base`. An empty `attributes` list asks for
    /// every user attribute.
    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<Entry>>;

    /// Close the session.
    async fn unbind(&mut self) -> Result<()>;
}

/// Opens [`Connection`]s.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// How [`Client`] holds its connections.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Fresh connection for every operation, unbound afterwards.
    #[default]
    PerOperation,
    /// One long-lived connection. Operations are serialized and the
    /// connection is rebound anonymously once done.
    Shared,
}

enum Session {
    PerOperation,
    Shared(Mutex<Option<Box<dyn Connection>>>),
}

/// Connection checked out for exactly one operation.
///
/// Dropping a lease without calling [`Lease::release`] (e.g. when the
/// request is cancelled) drops the connection itself, which closes the
/// socket; a shared slot is then left empty and reopened on next use.
struct Lease<'a> {
    conn: Box<dyn Connection>,
    slot: Option<MutexGuard<'a, Option<Box<dyn Connection>>>>,
}

impl Lease<'_> {
    async fn release(mut self) {
        match self.slot {
            None => {
                if let Err(err) = self.conn.unbind().await {
                    tracing::debug!(%err, "unbind failed");
                }
            },
            Some(mut slot) => match self.conn.bind("", "").await {
                Ok(()) => *slot = Some(self.conn),
                Err(err) => {
                    tracing::warn!(%err, "cannot drop privileges, discarding shared connection");
                    let _ = self.conn.unbind().await;
                },
            },
        }
    }
}

/// LDAP client bound to the service account for searches.
pub struct Client {
    connector: Arc<dyn Connector>,
    session: Session,
    base_dn: String,
    bind_dn: String,
    bind_password: String,
    require_tls: bool,
    timeout: Option<Duration>,
}

impl Client {
    /// Create a new [`Client`].
    pub fn new(
        connector: Arc<dyn Connector>,
        base_dn: impl Into<String>,
        bind_dn: impl Into<String>,
        bind_password: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            session: Session::PerOperation,
            base_dn: base_dn.into(),
            bind_dn: bind_dn.into(),
            bind_password: bind_password.into(),
            require_tls: false,
            timeout: None,
        }
    }

    /// Select the connection [`Mode`].
    pub fn mode(mut self, mode: Mode) -> Self {
        self.session = match mode {
            Mode::PerOperation => Session::PerOperation,
            Mode::Shared => Session::Shared(Mutex::new(None)),
        };
        self
    }

    /// Refuse to bind or search on sessions not running over TLS.
    pub fn require_tls(mut self, require_tls: bool) -> Self {
        self.require_tls = require_tls;
        self
    }

    /// Bound each operation in time. Zero disables the limit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Try to bind as `dn`.
    ///
    /// A rejected bind resolves to `false`. Only failures to reach the
    /// directory are returned as errors.
    pub async fn bind(&self, dn: &str, password: &str) -> Result<bool> {
        let outcome = self
            .timed(async {
                let mut lease = self.acquire().await?;
                let outcome = lease.conn.bind(dn, password).await;
                lease.release().await;
                outcome
            })
            .await;

        match outcome {
            Ok(()) => Ok(true),
            Err(LdapError::Status { code, message }) => {
                tracing::debug!(dn, code, %message, "bind rejected");
                Ok(false)
            },
            Err(err) => Err(err),
        }
    }

    /// Search with the service account and return the first matching entry.
    ///
    /// `base_dn` defaults to the configured base.
    pub async fn search(
        &self,
        filter: &str,
        attributes: Option<&[String]>,
        base_dn: Option<&str>,
    ) -> Result<Entry> {
        let base_dn = base_dn.unwrap_or(&self.base_dn);
        let attributes = attributes.unwrap_or_default();

        let entries = self
            .timed(async {
                let mut lease = self.acquire().await?;
                let outcome = match lease
                    .conn
                    .bind(&self.bind_dn, &self.bind_password)
                    .await
                {
                    Ok(()) => lease.conn.search(base_dn, filter, attributes).await,
                    Err(err) => Err(err),
                };
                lease.release().await;
                outcome
            })
            .await?;

        entries
            .into_iter()
            .next()
            .ok_or_else(|| LdapError::NotFound(filter.to_owned()))
    }

    async fn acquire(&self) -> Result<Lease<'_>> {
        let lease = match &self.session {
            Session::PerOperation => Lease {
                conn: self.connector.connect().await?,
                slot: None,
            },
            Session::Shared(slot) => {
                let mut slot = slot.lock().await;
                let conn = match slot.take() {
                    Some(conn) => conn,
                    None => self.connector.connect().await?,
                };
                Lease {
                    conn,
                    slot: Some(slot),
                }
            },
        };

        if self.require_tls && !lease.conn.is_secure() {
            // the lease is dropped without release: the connection is never reused.
            return Err(LdapError::TlsRequired);
        }

        Ok(lease)
    }

    async fn timed<T>(
        &self,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, operation)
                .await
                .map_err(|_| LdapError::Timeout)?,
            None => operation.await,
        }
    }
}

/// [`Connector`] backed by [`ldap3`].
#[derive(Debug, Clone)]
pub struct Ldap3Connector {
    addr: String,
    starttls: bool,
    timeout: Option<Duration>,
}

impl Ldap3Connector {
    /// Create a new [`Ldap3Connector`].
    pub fn new(addr: impl Into<String>, starttls: bool, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            starttls,
            timeout: (!timeout.is_zero()).then_some(timeout),
        }
    }
}

#[async_trait]
impl Connector for Ldap3Connector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut settings = LdapConnSettings::new().set_starttls(self.starttls);
        if let Some(timeout) = self.timeout {
            settings = settings.set_conn_timeout(timeout);
        }

        // StartTLS is negotiated before `with_settings` returns.
        let (handle, conn) = LdapConnAsync::with_settings(settings, &self.addr).await?;
        ldap3::drive!(handle);

        Ok(Box::new(Ldap3Connection {
            conn,
            secure: self.starttls || self.addr.starts_with("ldaps://"),
        }))
    }
}

struct Ldap3Connection {
    conn: Ldap3,
    secure: bool,
}

#[async_trait]
impl Connection for Ldap3Connection {
    fn is_secure(&self) -> bool {
        self.secure
    }

    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        self.conn.simple_bind(dn, password).await?.success()?;
        Ok(())
    }

    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<Entry>> {
        let (results, _) = self
            .conn
            .search(base, Scope::Subtree, filter, attributes.to_vec())
            .await?
            .success()?;

        Ok(results
            .into_iter()
            .map(|entry| SearchEntry::construct(entry).into())
            .collect())
    }

    async fn unbind(&mut self) -> Result<()> {
        self.conn.unbind().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldap::mock::{Directory, MockConnector, SERVICE_DN, SERVICE_PASSWORD};

    const BASE_DN: &str = "dc=example,dc=com";
    const USER_DN: &str = "uid=john.doe,dc=example,dc=com";

    fn client(directory: &Directory) -> Client {
        Client::new(
            Arc::new(MockConnector::new(directory.clone())),
            BASE_DN,
            SERVICE_DN,
            SERVICE_PASSWORD,
        )
    }

    #[tokio::test]
    async fn test_bind() {
        let directory = Directory::with_john_doe();
        let client = client(&directory);

        assert_eq!(client.bind(USER_DN, "secret").await, Ok(true));
        assert_eq!(client.bind(USER_DN, "wrong").await, Ok(false));

        let state = directory.state();
        assert_eq!(state.binds, 2);
        assert_eq!(state.unbinds, 2);
        assert_eq!(state.connects, 2);
    }

    #[tokio::test]
    async fn test_bind_connection_error() {
        let directory = Directory::with_john_doe();
        directory.update(|state| state.unreachable = true);

        assert!(matches!(
            client(&directory).bind(USER_DN, "secret").await,
            Err(LdapError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_search() {
        let directory = Directory::with_john_doe();
        let entry = client(&directory)
            .search("(uid=john.doe)", None, None)
            .await
            .unwrap();

        assert_eq!(entry.dn, USER_DN);

        let state = directory.state();
        assert_eq!(state.bound_dns, [SERVICE_DN]);
        assert_eq!(state.searched_bases, [BASE_DN]);
        assert_eq!(state.unbinds, 1);
    }

    #[tokio::test]
    async fn test_search_custom_base() {
        let directory = Directory::with_john_doe();
        let _ = client(&directory)
            .search("(uid=john.doe)", Some(&["uid".to_owned()][..]), Some("ou=people,dc=example,dc=com"))
            .await;

        assert_eq!(directory.state().searched_bases, ["ou=people,dc=example,dc=com"]);
    }

    #[tokio::test]
    async fn test_search_first_entry_only() {
        let directory = Directory::with_john_doe();
        directory.update(|state| {
            state.entries.push(
                Entry::new("uid=john.doe,ou=old,dc=example,dc=com").attr("uid", "john.doe"),
            )
        });

        let entry = client(&directory)
            .search("(uid=john.doe)", None, None)
            .await
            .unwrap();
        assert_eq!(entry.dn, USER_DN);
    }

    #[tokio::test]
    async fn test_search_not_found() {
        let directory = Directory::with_john_doe();

        assert_eq!(
            client(&directory).search("(uid=ghost)", None, None).await,
            Err(LdapError::NotFound("(uid=ghost)".into()))
        );
        assert_eq!(directory.state().unbinds, 1);
    }

    #[tokio::test]
    async fn test_search_service_bind_rejected() {
        let directory = Directory::with_john_doe();
        directory.update(|state| {
            state.accounts.insert(SERVICE_DN.into(), "rotated".into());
        });

        assert!(matches!(
            client(&directory).search("(uid=john.doe)", None, None).await,
            Err(LdapError::Status { code: 49, .. })
        ));

        let state = directory.state();
        assert_eq!(state.searches, 0);
        assert_eq!(state.unbinds, 1);
    }

    #[tokio::test]
    async fn test_search_status() {
        let directory = Directory::with_john_doe();
        directory.update(|state| state.search_status = Some(32));

        assert!(matches!(
            client(&directory).search("(uid=john.doe)", None, None).await,
            Err(LdapError::Status { code: 32, .. })
        ));
        assert_eq!(directory.state().unbinds, 1);
    }

    #[tokio::test]
    async fn test_require_tls() {
        let directory = Directory::with_john_doe();
        let client = client(&directory).require_tls(true);

        assert_eq!(client.bind(USER_DN, "secret").await, Err(LdapError::TlsRequired));
        assert_eq!(
            client.search("(uid=john.doe)", None, None).await,
            Err(LdapError::TlsRequired)
        );
        assert_eq!(directory.state().binds, 0);
        assert_eq!(directory.state().searches, 0);

        directory.update(|state| state.secure = true);
        assert_eq!(client.bind(USER_DN, "secret").await, Ok(true));
    }

    #[tokio::test]
    async fn test_timeout() {
        let directory = Directory::with_john_doe();
        directory.update(|state| state.latency = Some(Duration::from_millis(200)));
        let client = client(&directory).timeout(Duration::from_millis(20));

        assert_eq!(client.bind(USER_DN, "secret").await, Err(LdapError::Timeout));
        assert_eq!(
            client.search("(uid=john.doe)", None, None).await,
            Err(LdapError::Timeout)
        );
    }

    #[tokio::test]
    async fn test_shared_connection() {
        let directory = Directory::with_john_doe();
        let client = client(&directory).mode(Mode::Shared);

        assert_eq!(client.bind(USER_DN, "secret").await, Ok(true));
        assert!(client.search("(uid=john.doe)", None, None).await.is_ok());
        assert_eq!(client.bind(USER_DN, "wrong").await, Ok(false));

        let state = directory.state();
        assert_eq!(state.connects, 1);
        assert_eq!(state.unbinds, 0);
        // every operation ends with an anonymous bind.
        assert_eq!(
            state.bound_dns,
            [USER_DN, "", SERVICE_DN, "", USER_DN, ""]
        );
    }

    #[tokio::test]
    async fn test_shared_connection_serialized() {
        let directory = Directory::with_john_doe();
        directory.update(|state| state.latency = Some(Duration::from_millis(10)));
        let client = Arc::new(client(&directory).mode(Mode::Shared));

        let tasks = (0..4).map(|_| {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.search("(uid=john.doe)", None, None).await })
        });
        for task in tasks.collect::<Vec<_>>() {
            assert!(task.await.unwrap().is_ok());
        }

        let state = directory.state();
        assert_eq!(state.max_in_flight, 1);
        assert_eq!(
            state.bound_dns,
            [SERVICE_DN, "", SERVICE_DN, "", SERVICE_DN, "", SERVICE_DN, ""]
        );
    }

    #[tokio::test]
    async fn test_shared_connection_discarded_on_timeout() {
        let directory = Directory::with_john_doe();
        directory.update(|state| state.latency = Some(Duration::from_millis(200)));
        let client = client(&directory)
            .mode(Mode::Shared)
            .timeout(Duration::from_millis(20));

        assert_eq!(client.bind(USER_DN, "secret").await, Err(LdapError::Timeout));

        directory.update(|state| state.latency = None);
        assert_eq!(client.bind(USER_DN, "secret").await, Ok(true));
        assert_eq!(directory.state().connects, 2);
    }
}
