//! Reservoir lock: an object at `_reservoir.lock`. Fail-fast on
//! contention — unlike [`crate::error`]'s general-purpose usage, this is
//! deliberately simpler than a stale-timeout auto-removing lock, since
//! the reservoir's correctness depends on genuine mutual exclusion, not
//! liveness under a crashed holder (see design notes: advisory,
//! best-effort, race-prone on eventually consistent stores).

use crate::error::AltoError;
use crate::store::ObjectStore;

pub struct ReservoirLock<'a> {
    store: &'a dyn ObjectStore,
    path: String,
}

impl<'a> ReservoirLock<'a> {
    /// Fails immediately with [`AltoError::ReservoirLocked`] if the lock
    /// object already exists.
    pub fn acquire(store: &'a dyn ObjectStore, path: &str, identity: &str) -> Result<Self, AltoError> {
        if store.exists(path) {
            return Err(AltoError::ReservoirLocked(std::path::PathBuf::from(path)));
        }
        store
            .pipe(path, identity.as_bytes())
            .map_err(|e| AltoError::store(path, e.to_string()))?;
        Ok(Self {
            store,
            path: path.to_string(),
        })
    }

    pub fn release(self) -> Result<(), AltoError> {
        self.store
            .rm(&self.path)
            .map_err(|e| AltoError::store(&self.path, e.to_string()))
    }
}
