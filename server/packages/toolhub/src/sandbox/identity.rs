use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;

use super::{ContainerEngine, SandboxError};
use crate::db::DbScope;
use crate::store::DbAccess;

const CREDENTIAL_LEN: usize = 48;

/// What a running container may do through the callback proxy.
#[derive(Clone, PartialEq)]
pub struct ContainerSession {
    pub chat_id: String,
    pub access: DbAccess,
    pub credential: String,
}

impl ContainerSession {
    /// A session with a freshly minted credential.
    pub fn new(chat_id: impl Into<String>, access: DbAccess) -> Self {
        let credential = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(CREDENTIAL_LEN)
            .map(char::from)
            .collect();
        Self {
            chat_id: chat_id.into(),
            access,
            credential,
        }
    }

    pub fn db_scope(&self) -> DbScope {
        DbScope {
            chat_id: self.chat_id.clone(),
            access: self.access.clone(),
            credential: Some(self.credential.clone()),
        }
    }
}

impl std::fmt::Debug for ContainerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSession")
            .field("chat_id", &self.chat_id)
            .field("access", &self.access)
            .field("credential", &"<redacted>")
            .finish()
    }
}

struct AddressCache {
    /// Sorted registered names the addresses were computed for.
    names: Vec<String>,
    by_address: HashMap<IpAddr, String>,
    /// Every registered container had an address when computed.
    complete: bool,
}

struct Registration {
    session: ContainerSession,
    /// Attached to a network, so it can have a source address.
    addressable: bool,
}

struct RegistryInner {
    sessions: StdMutex<BTreeMap<String, Registration>>,
    cache: Mutex<Option<AddressCache>>,
    engine: Arc<dyn ContainerEngine>,
}

/// Maps running sandbox containers to the chat that started them.
///
/// Entries are inserted right before a container starts and removed right
/// after it stops. Address lookups go through a cache keyed by the sorted set
/// of registered addressable names; any membership change recomputes it.
/// Containers without a network are registered but never inspected.
#[derive(Clone)]
pub struct ContainerRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("containers", &self.names())
            .finish()
    }
}

impl ContainerRegistry {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: StdMutex::new(BTreeMap::new()),
                cache: Mutex::new(None),
                engine,
            }),
        }
    }

    pub fn set(&self, name: &str, session: ContainerSession) {
        self.insert(name, session, true);
    }

    /// Registers a container that runs without a network.
    pub fn set_offline(&self, name: &str, session: ContainerSession) {
        self.insert(name, session, false);
    }

    fn insert(&self, name: &str, session: ContainerSession, addressable: bool) {
        if let Ok(mut sessions) = self.inner.sessions.lock() {
            sessions.insert(
                name.to_string(),
                Registration {
                    session,
                    addressable,
                },
            );
        }
    }

    /// Removes an entry. Returns whether it was present; deleting twice is fine.
    pub fn delete(&self, name: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .map(|mut sessions| sessions.remove(name).is_some())
            .unwrap_or(false)
    }

    pub fn get(&self, name: &str) -> Option<ContainerSession> {
        self.inner
            .sessions
            .lock()
            .ok()
            .and_then(|sessions| sessions.get(name).map(|entry| entry.session.clone()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .sessions
            .lock()
            .map(|sessions| sessions.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }

    fn addressable_names(&self) -> Vec<String> {
        self.inner
            .sessions
            .lock()
            .map(|sessions| {
                sessions
                    .iter()
                    .filter(|(_, entry)| entry.addressable)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolves a caller's source address to the container registered for it.
    pub async fn get_by_address(
        &self,
        address: IpAddr,
    ) -> Result<Option<(String, ContainerSession)>, SandboxError> {
        let address = canonical(address);
        let names = self.addressable_names();
        if names.is_empty() {
            return Ok(None);
        }

        let mut cache = self.inner.cache.lock().await;
        let stale = match cache.as_ref() {
            Some(cached) => cached.names != names || !cached.complete,
            None => true,
        };
        if stale {
            let addresses = self.inner.engine.container_addresses(&names).await?;
            let complete = names.iter().all(|name| addresses.contains_key(name));
            tracing::debug!(
                containers = names.len(),
                resolved = addresses.len(),
                "recomputed sandbox container addresses"
            );
            *cache = Some(AddressCache {
                names,
                by_address: addresses
                    .into_iter()
                    .map(|(name, address)| (canonical(address), name))
                    .collect(),
                complete,
            });
        }

        let name = cache
            .as_ref()
            .and_then(|cached| cached.by_address.get(&address).cloned());
        drop(cache);

        // The entry may have been deleted while addresses were being computed.
        Ok(name.and_then(|name| self.get(&name).map(|session| (name, session))))
    }
}

fn canonical(address: IpAddr) -> IpAddr {
    match address {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
