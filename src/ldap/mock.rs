//! In-memory directory used by tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{Connection, Connector, Entry, LdapError, Result};

pub const SERVICE_DN: &str = "uid=bind,dc=example,dc=com";
pub const SERVICE_PASSWORD: &str = "bindsecret";

/// Scripted directory state, shared by every connection it hands out.
#[derive(Debug, Default)]
pub struct State {
    pub entries: Vec<Entry>,
    /// DN to password.
    pub accounts: HashMap<String, String>,
    pub unreachable: bool,
    pub secure: bool,
    pub search_status: Option<u32>,
    pub latency: Option<Duration>,

    pub connects: usize,
    pub binds: usize,
    pub searches: usize,
    pub unbinds: usize,
    pub bound_dns: Vec<String>,
    pub searched_bases: Vec<String>,
    pub searched_filters: Vec<String>,
    pub searched_attributes: Vec<Vec<String>>,
    in_flight: usize,
    pub max_in_flight: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Directory(Arc<Mutex<State>>);

impl Directory {
    /// Directory holding `john.doe` (password `secret`) member of `test`.
    pub fn with_john_doe() -> Self {
        let directory = Self::default();
        directory.update(|state| {
            state.accounts.insert(SERVICE_DN.into(), SERVICE_PASSWORD.into());
            state.accounts.insert(
                "uid=john.doe,dc=example,dc=com".into(),
                "secret".into(),
            );
            state.entries.push(
                Entry::new("uid=john.doe,dc=example,dc=com")
                    .attr("uid", "john.doe")
                    .attr("memberOf", vec!["cn=test,dc=example,dc=com".to_owned()])
                    .attr("uidNumber", "1")
                    .attr("gidNumber", "10")
                    .attr("mail", "john.doe@example.com"),
            );
        });
        directory
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap()
    }

    pub fn update(&self, f: impl FnOnce(&mut State)) {
        f(&mut self.state());
    }

    async fn enter(&self) -> Result<()> {
        let latency = {
            let mut state = self.state();
            if state.unreachable {
                return Err(LdapError::Connection("connection refused".into()));
            }
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.latency
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.state().in_flight -= 1;
        Ok(())
    }
}

pub struct MockConnector(Directory);

impl MockConnector {
    pub fn new(directory: Directory) -> Self {
        Self(directory)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let mut state = self.0.state();
        if state.unreachable {
            return Err(LdapError::Connection("connection refused".into()));
        }
        state.connects += 1;

        Ok(Box::new(MockConnection {
            directory: self.0.clone(),
            secure: state.secure,
        }))
    }
}

struct MockConnection {
    directory: Directory,
    secure: bool,
}

#[async_trait]
impl Connection for MockConnection {
    fn is_secure(&self) -> bool {
        self.secure
    }

    async fn bind(&mut self, dn: &str, password: &str) -> Result<()> {
        {
            let mut state = self.directory.state();
            state.binds += 1;
            state.bound_dns.push(dn.to_owned());
        }
        self.directory.enter().await?;

        let state = self.directory.state();
        let anonymous = dn.is_empty() && password.is_empty();
        if anonymous || state.accounts.get(dn).is_some_and(|p| p == password) {
            Ok(())
        } else {
            Err(LdapError::Status {
                code: 49,
                message: "invalid credentials".into(),
            })
        }
    }

    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<Entry>> {
        {
            let mut state = self.directory.state();
            state.searches += 1;
            state.searched_attributes.push(attributes.to_vec());
            state.searched_bases.push(base.to_owned());
            state.searched_filters.push(filter.to_owned());
        }
        self.directory.enter().await?;

        let state = self.directory.state();
        if let Some(code) = state.search_status {
            return Err(LdapError::Status {
                code,
                message: "search failed".into(),
            });
        }

        // only `(attr=value)` filters are understood.
        let (name, value) = filter
            .trim_start_matches('(')
            .trim_end_matches(')')
            .split_once('=')
            .unwrap_or_default();

        // attribute list is ignored, like a lax server would.
        Ok(state
            .entries
            .iter()
            .filter(|entry| {
                entry
                    .get(name)
                    .is_some_and(|attr| attr.values().iter().any(|v| v == value))
            })
            .cloned()
            .collect())
    }

    async fn unbind(&mut self) -> Result<()> {
        self.directory.state().unbinds += 1;
        Ok(())
    }
}
