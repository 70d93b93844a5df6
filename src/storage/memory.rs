//! In-memory pool store
//!
//! This module provides a versioned in-process store with the same
//! conditional-write contract as the networked backends. Clones share state,
//! so one `MemoryStore` can serve many concurrent orchestrator calls.

use crate::allocate::IpReservation;
use crate::config::IpamConfig;
use crate::storage::{
    cancellable, ensure_unique, Backend, IpPool, Store, StoreError, StoreResult,
};
use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct PoolState {
    version: u64,
    reservations: Vec<IpReservation>,
}

#[derive(Debug, Default)]
struct Shared {
    pools: Mutex<HashMap<IpNet, PoolState>>,
    opens: AtomicUsize,
    status_calls: AtomicUsize,
    closes: AtomicUsize,
    updates: AtomicUsize,
    /// Upcoming updates that lose to a simulated concurrent writer
    forced_conflicts: AtomicUsize,
    unhealthy: Mutex<Option<String>>,
    close_failure: Mutex<Option<String>>,
}

/// In-memory versioned store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Reservations currently committed for `range`
    pub fn reservations(&self, range: &IpNet) -> Vec<IpReservation> {
        self.shared
            .pools
            .lock()
            .get(range)
            .map(|pool| pool.reservations.clone())
            .unwrap_or_default()
    }

    /// Committed version for `range`; zero if never written
    pub fn version(&self, range: &IpNet) -> u64 {
        self.shared
            .pools
            .lock()
            .get(range)
            .map(|pool| pool.version)
            .unwrap_or(0)
    }

    /// Overwrite `range` unconditionally, bumping its version
    pub fn seed(&self, range: IpNet, reservations: Vec<IpReservation>) {
        let mut pools = self.shared.pools.lock();
        let pool = pools.entry(range).or_default();
        pool.version += 1;
        pool.reservations = reservations;
    }

    /// Make the next `count` updates fail as if another writer got there first
    pub fn force_conflicts(&self, count: usize) {
        self.shared.forced_conflicts.store(count, Ordering::SeqCst);
    }

    /// Fail every health probe with `message`
    pub fn set_unhealthy(&self, message: impl Into<String>) {
        *self.shared.unhealthy.lock() = Some(message.into());
    }

    /// Fail every session close with `message`
    pub fn fail_close(&self, message: impl Into<String>) {
        *self.shared.close_failure.lock() = Some(message.into());
    }

    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn status_count(&self) -> usize {
        self.shared.status_calls.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.shared.updates.load(Ordering::SeqCst)
    }

    fn take_forced_conflict(&self) -> bool {
        self.shared
            .forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Backend for MemoryStore {
    async fn open(
        &self,
        _config: &IpamConfig,
        _container_id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<Box<dyn Store>> {
        if cancel.is_cancelled() {
            return Err(StoreError::cancelled());
        }
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn status(&self, cancel: &CancellationToken) -> StoreResult<()> {
        self.shared.status_calls.fetch_add(1, Ordering::SeqCst);
        cancellable(cancel, async {
            match self.shared.unhealthy.lock().clone() {
                Some(message) => Err(StoreError::permanent(message)),
                None => Ok(()),
            }
        })
        .await
    }

    async fn get_ip_pool(
        &self,
        range: &IpNet,
        cancel: &CancellationToken,
    ) -> StoreResult<Box<dyn IpPool>> {
        cancellable(cancel, async {
            let pools = self.shared.pools.lock();
            let (version, reservations) = pools
                .get(range)
                .map(|pool| (pool.version, pool.reservations.clone()))
                .unwrap_or_default();
            Ok(Box::new(MemoryPool {
                store: self.clone(),
                range: *range,
                version,
                reservations,
            }) as Box<dyn IpPool>)
        })
        .await
    }

    async fn close(&self, _cancel: &CancellationToken) -> StoreResult<()> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        match self.shared.close_failure.lock().clone() {
            Some(message) => Err(StoreError::permanent(message)),
            None => Ok(()),
        }
    }
}

/// Snapshot handle bound to the version it was read at
#[derive(Debug)]
pub struct MemoryPool {
    store: MemoryStore,
    range: IpNet,
    version: u64,
    reservations: Vec<IpReservation>,
}

#[async_trait]
impl IpPool for MemoryPool {
    fn allocations(&self) -> &[IpReservation] {
        &self.reservations
    }

    async fn update(
        &self,
        reservations: &[IpReservation],
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        cancellable(cancel, async {
            self.store.shared.updates.fetch_add(1, Ordering::SeqCst);

            let mut pools = self.store.shared.pools.lock();
            let pool = pools.entry(self.range).or_default();

            if self.store.take_forced_conflict() {
                pool.version += 1;
            }
            if pool.version != self.version {
                return Err(StoreError::conflict(format!(
                    "pool {} moved from version {} to {}",
                    self.range, self.version, pool.version
                )));
            }

            ensure_unique(&self.range, reservations)?;

            pool.version += 1;
            pool.reservations = reservations.to_vec();
            Ok(())
        })
        .await
    }
}
