// Entity lock manager.
//
// Grants exclusive ownership of one (entity kind, id) pair to a single
// workflow instance at a time. Every mutating activity and provider
// dispatch takes an explicit LockToken and fails closed without a valid
// one; there is no ambient "is the context locked" check. The lock table
// is part of durable state and survives an engine restart through
// snapshot/restore.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

/// Entity kinds, ordered by the fixed global acquisition order used to
/// avoid deadlock: project before user before provider before data.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum EntityKind {
    Project,
    User,
    Provider,
    ProviderData,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::Project => "project",
            EntityKind::User => "user",
            EntityKind::Provider => "provider",
            EntityKind::ProviderData => "provider_data",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    pub kind: EntityKind,
    pub id: String,
}

impl LockKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Exclusive ownership; blocks or fails fast per the wait policy
    Exclusive,
    /// Bypass for read-only system operations. The returned token is not
    /// valid for writes. Callers opt in explicitly at the call site.
    UnsafeRead,
}

/// How an exclusive acquisition behaves when the key is already held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    Wait(Duration),
    FailFast,
}

/// Proof of lock ownership, handed to activities and dispatches that
/// mutate the locked entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: LockKey,
    instance_id: Uuid,
    nonce: Uuid,
    read_only: bool,
}

impl LockToken {
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock on {key} not acquired within {waited_ms}ms (held by instance {holder})")]
    Timeout {
        key: LockKey,
        holder: Uuid,
        waited_ms: u64,
    },

    #[error("lock on {key} is held by instance {holder}")]
    HeldByOther { key: LockKey, holder: Uuid },

    #[error("no lock token held for {key}")]
    MissingToken { key: LockKey },

    #[error("token for {key} is not valid for the current lock state")]
    InvalidToken { key: LockKey },

    #[error("read-only token for {key} cannot authorize a write")]
    ReadOnlyToken { key: LockKey },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockEntry {
    holder: Uuid,
    nonce: Uuid,
    acquired_at: DateTime<Utc>,
}

/// Serializable view of the lock table for durable persistence
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockTableSnapshot {
    entries: Vec<(LockKey, LockEntry)>,
}

#[derive(Debug, Default)]
pub struct EntityLockManager {
    table: Mutex<HashMap<LockKey, LockEntry>>,
    released: Notify,
}

impl EntityLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire a lock for a workflow instance.
    ///
    /// Re-acquiring a key already held by the same instance is a no-op
    /// grant, so replay-time re-acquisition after a crash is safe.
    pub async fn acquire(
        &self,
        key: LockKey,
        mode: LockMode,
        instance_id: Uuid,
        policy: WaitPolicy,
    ) -> Result<LockToken, LockError> {
        if mode == LockMode::UnsafeRead {
            debug!(key = %key, instance = %instance_id, "unsafe read bypass granted");
            return Ok(LockToken {
                key,
                instance_id,
                nonce: Uuid::new_v4(),
                read_only: true,
            });
        }

        let started = tokio::time::Instant::now();
        let deadline = match policy {
            WaitPolicy::Wait(timeout) => Some(started + timeout),
            WaitPolicy::FailFast => None,
        };

        loop {
            // Register for release notifications before inspecting the
            // table so a release between the check and the await is not
            // lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let holder = {
                let mut table = self.table.lock().await;
                match table.get(&key) {
                    None => {
                        let entry = LockEntry {
                            holder: instance_id,
                            nonce: Uuid::new_v4(),
                            acquired_at: Utc::now(),
                        };
                        let nonce = entry.nonce;
                        table.insert(key.clone(), entry);
                        debug!(key = %key, instance = %instance_id, "lock acquired");
                        return Ok(LockToken {
                            key,
                            instance_id,
                            nonce,
                            read_only: false,
                        });
                    }
                    Some(entry) if entry.holder == instance_id => {
                        return Ok(LockToken {
                            key,
                            instance_id,
                            nonce: entry.nonce,
                            read_only: false,
                        });
                    }
                    Some(entry) => entry.holder,
                }
            };

            let Some(deadline) = deadline else {
                return Err(LockError::HeldByOther { key, holder });
            };

            if tokio::time::Instant::now() >= deadline {
                warn!(key = %key, holder = %holder, "lock acquisition timed out");
                return Err(LockError::Timeout {
                    key,
                    holder,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            // Wake on any release and re-check; spurious wakeups only cost
            // another pass over the table.
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }

    /// Idempotent release. Releasing a never-acquired or already-released
    /// key is a no-op so crash-recovery release paths are safe. Only the
    /// holding instance can release its entry.
    pub async fn release(&self, key: &LockKey, instance_id: Uuid) {
        let mut table = self.table.lock().await;
        if let Some(entry) = table.get(key) {
            if entry.holder == instance_id {
                table.remove(key);
                debug!(key = %key, instance = %instance_id, "lock released");
                self.released.notify_waiters();
            }
        }
    }

    /// Release every lock held by an instance. Called on every workflow
    /// exit path.
    pub async fn release_all(&self, instance_id: Uuid) {
        let mut table = self.table.lock().await;
        let before = table.len();
        table.retain(|_, entry| entry.holder != instance_id);
        if table.len() != before {
            debug!(instance = %instance_id, released = before - table.len(), "released instance locks");
            self.released.notify_waiters();
        }
    }

    /// Fail-closed write authorization: the token must match the live
    /// table entry for its key.
    pub async fn validate_write(&self, token: &LockToken) -> Result<(), LockError> {
        if token.read_only {
            return Err(LockError::ReadOnlyToken {
                key: token.key.clone(),
            });
        }
        let table = self.table.lock().await;
        match table.get(&token.key) {
            Some(entry) if entry.holder == token.instance_id && entry.nonce == token.nonce => {
                Ok(())
            }
            _ => Err(LockError::InvalidToken {
                key: token.key.clone(),
            }),
        }
    }

    pub async fn is_held(&self, key: &LockKey) -> bool {
        self.table.lock().await.contains_key(key)
    }

    pub async fn holder(&self, key: &LockKey) -> Option<Uuid> {
        self.table.lock().await.get(key).map(|e| e.holder)
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }

    /// Durable view of the table, persisted alongside workflow history
    pub async fn snapshot(&self) -> LockTableSnapshot {
        let table = self.table.lock().await;
        let mut entries: Vec<_> = table.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        LockTableSnapshot { entries }
    }

    /// Restore the table after a restart. Entries whose holder is no
    /// longer an active instance are dropped rather than kept until some
    /// timeout; the resumed instance re-acquires re-entrantly.
    pub async fn restore(&self, snapshot: LockTableSnapshot, active_instances: &HashSet<Uuid>) {
        let mut table = self.table.lock().await;
        table.clear();
        for (key, entry) in snapshot.entries {
            if active_instances.contains(&entry.holder) {
                table.insert(key, entry);
            } else {
                debug!(key = %key, holder = %entry.holder, "dropping stale lock entry on restore");
            }
        }
    }
}

/// The tokens one workflow instance holds, bound to the manager that
/// issued them. Mutating activities and dispatches authorize each entity
/// they touch against this set and fail closed when no live token covers
/// it.
#[derive(Clone)]
pub struct LockSet {
    manager: Arc<EntityLockManager>,
    tokens: Vec<LockToken>,
}

impl LockSet {
    pub fn new(manager: Arc<EntityLockManager>, tokens: Vec<LockToken>) -> Self {
        Self { manager, tokens }
    }

    pub fn tokens(&self) -> &[LockToken] {
        &self.tokens
    }

    pub fn token_for(&self, kind: EntityKind, id: &str) -> Option<&LockToken> {
        self.tokens
            .iter()
            .find(|t| t.key.kind == kind && t.key.id == id)
    }

    /// Fail-closed write authorization for one entity: a token must be
    /// held for the key and still match the live table.
    pub async fn authorize_write(&self, kind: EntityKind, id: &str) -> Result<(), LockError> {
        match self.token_for(kind, id) {
            Some(token) => self.manager.validate_write(token).await,
            None => Err(LockError::MissingToken {
                key: LockKey::new(kind, id),
            }),
        }
    }

    /// Every held token must still match the live table
    pub async fn authorize_all(&self) -> Result<(), LockError> {
        for token in &self.tokens {
            self.manager.validate_write(token).await?;
        }
        Ok(())
    }
}
