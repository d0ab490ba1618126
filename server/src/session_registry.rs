//! Registry of active chat sessions
//!
//! This module tracks which usernames are currently connected:
//! - Atomic check-and-insert so two connections never share a name
//! - Owner-checked removal so a session only ever frees its own entry
//! - Point-in-time snapshots of the other sessions for broadcasting
//!
//! The registry is built once by the server and shared with every session
//! worker through an `Arc`. Callers never need their own locking.

use crate::connection::PeerHandle;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info};
use std::sync::Arc;

/// Concurrent mapping from username to the owning session's send side
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, PeerHandle>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Registers `username` if nobody holds it yet
    ///
    /// The check and the insert happen under the same shard lock, so of two
    /// racing registrations for one name exactly one returns true. A losing
    /// call leaves the registry untouched.
    pub fn try_register(&self, username: &str, handle: PeerHandle) -> bool {
        let registered = match self.sessions.entry(username.to_string()) {
            Entry::Occupied(_) => {
                debug!("Username {} already taken", username);
                false
            }
            Entry::Vacant(slot) => {
                info!(
                    "Registered {} for connection {} from {}",
                    username,
                    handle.id(),
                    handle.addr()
                );
                slot.insert(handle);
                true
            }
        };

        // The shard lock is released here; listing every shard under it would deadlock
        if registered {
            debug!("Active users: {:?}", self.usernames());
        }
        registered
    }

    /// Removes `username` only while it still maps to `handle`
    ///
    /// Returns true if an entry was removed. A stale handle, or a name that
    /// has already been released, leaves the registry untouched.
    pub fn unregister(&self, username: &str, handle: &PeerHandle) -> bool {
        let removed = self
            .sessions
            .remove_if(username, |_, current| current.id() == handle.id())
            .is_some();

        if removed {
            info!("Unregistered {} (connection {})", username, handle.id());
            debug!("Active users: {:?}", self.usernames());
        }
        removed
    }

    /// Returns every session except `exclude`
    ///
    /// Sessions added or removed while the snapshot is taken may or may not
    /// appear in it. Broadcasting is best effort, so that is acceptable.
    pub fn snapshot_others(&self, exclude: &str) -> Vec<(String, PeerHandle)> {
        self.sessions
            .iter()
            .filter(|entry| entry.key() != exclude)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn contains(&self, username: &str) -> bool {
        self.sessions.contains_key(username)
    }

    /// Registered usernames in sorted order
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Returns the number of active sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns true if no session is registered
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

/// Ownership of one registry entry
///
/// Dropping the guard unregisters the name, so the entry is released on
/// every exit path of a session: normal return, error, panic or task abort.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<SessionRegistry>,
    username: String,
    handle: PeerHandle,
}

impl Registration {
    /// Registers `username` and returns the guard, or `None` if it is taken
    pub fn acquire(
        registry: &Arc<SessionRegistry>,
        username: &str,
        handle: PeerHandle,
    ) -> Option<Self> {
        if !registry.try_register(username, handle.clone()) {
            return None;
        }

        Some(Self {
            registry: Arc::clone(registry),
            username: username.to_string(),
            handle,
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.username, &self.handle);
    }
}
