//! In-memory registration table (§6.3).
//!
//! The broker holds no persistent state across restarts — a producer
//! that re-registers after a broker restart simply re-wins the name
//! (the registry has nothing left to conflict with). This mirrors the
//! informational, out-of-band nature of the service: nothing here is
//! load-bearing for the data plane.

use crate::protocol::{DeregisterRequest, DiscoverOk, DiscoverRequest, RegisterRequest, Reply};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct Registration {
    shm_name: String,
    schema_hash: String,
    secret_hash: String,
    endpoint: Option<String>,
}

/// Thread-safe table of channel name -> registration, guarded by a
/// single mutex (registrations are rare relative to the data plane's
/// own traffic, so a simple lock is sufficient — no data plane
/// operation ever waits on this type).
pub struct Registry {
    entries: Mutex<HashMap<String, Registration>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Handle `REG_REQ` (§6.3): refuses with `CONFLICT` if the channel is
    /// already registered under a different `shm_name` or secret hash,
    /// and treats a resubmission of the identical registration as
    /// idempotent (a producer restarting with the same parameters should
    /// not need to deregister first).
    pub fn register(&self, req: RegisterRequest) -> Reply {
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        if let Some(existing) = entries.get(&req.channel) {
            let identical = existing.shm_name == req.shm_name
                && existing.secret_hash == req.secret_hash
                && existing.schema_hash == req.schema_hash;
            if !identical {
                warn!(channel = %req.channel, "registration conflict");
                return Reply::Conflict;
            }
        }
        info!(channel = %req.channel, shm_name = %req.shm_name, "channel registered");
        entries.insert(
            req.channel.clone(),
            Registration {
                shm_name: req.shm_name,
                schema_hash: req.schema_hash,
                secret_hash: req.secret_hash,
                endpoint: req.endpoint,
            },
        );
        Reply::Ok
    }

    /// Handle `DISC_REQ` (§6.3): `NOT_FOUND` if the channel is unknown,
    /// `AUTH_FAILED` if `secret_hash` does not match the registered
    /// value, otherwise the segment's discovery details.
    pub fn discover(&self, req: DiscoverRequest) -> Reply {
        let entries = self.entries.lock().expect("registry mutex poisoned");
        match entries.get(&req.channel) {
            None => {
                debug!(channel = %req.channel, "discovery miss");
                Reply::NotFound
            }
            Some(entry) if entry.secret_hash != req.secret_hash => {
                warn!(channel = %req.channel, "discovery auth failure");
                Reply::AuthFailed
            }
            Some(entry) => Reply::OkDiscover(DiscoverOk {
                shm_name: entry.shm_name.clone(),
                schema_hash: entry.schema_hash.clone(),
                endpoint: entry.endpoint.clone(),
            }),
        }
    }

    /// Handle `DEREG_REQ` (§6.3): always `OK`, whether or not the
    /// channel was registered — de-registering something already gone is
    /// not an error (the producer may be racing its own cleanup).
    pub fn deregister(&self, req: DeregisterRequest) -> Reply {
        let mut entries = self.entries.lock().expect("registry mutex poisoned");
        if entries.remove(&req.channel).is_some() {
            info!(channel = %req.channel, "channel deregistered");
        }
        Reply::Ok
    }

    /// Number of channels currently registered (for diagnostics/tests).
    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry mutex poisoned").len()
    }

    /// `true` if no channel is currently registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
