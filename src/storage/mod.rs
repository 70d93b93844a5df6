//! Storage layer
//!
//! # Architecture
//!
//! ```text
//! Backend ──open──> Store ──get_ip_pool(range)──> IpPool
//!                     │                            ├─ allocations()   (snapshot)
//!                     ├─ status()                  └─ update(list)    (conditional)
//!                     └─ close()
//! ```
//!
//! Every pool handle remembers the backend version it was read at. An update
//! commits only if the stored version still matches; otherwise it fails with
//! [`StoreErrorKind::Conflict`], the one error kind the orchestrator retries.
//!
//! ## Implementations
//!
//! - [`EtcdStore`]: one key per range, guarded by the key's mod revision
//! - [`KubernetesStore`]: one `IPPool` custom resource per range, guarded by
//!   its `resourceVersion`
//! - [`MemoryStore`]: in-process versioned map for tests and embedding

pub mod etcd;
pub mod kubernetes;
pub mod memory;

pub use etcd::EtcdStore;
pub use kubernetes::KubernetesStore;
pub use memory::MemoryStore;

use crate::allocate::IpReservation;
use crate::config::{Datastore, IpamConfig};
use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::HashSet;
use std::future::Future;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Classification carried on every backend error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Stored version moved since the read; retry from a fresh snapshot
    Conflict,
    /// Anything that retrying will not fix
    Permanent,
    /// The caller's token fired while waiting
    Cancelled,
}

/// Backend error
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct StoreError {
    kind: StoreErrorKind,
    message: String,
}

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Conflict, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Permanent, message)
    }

    pub fn cancelled() -> Self {
        Self::new(StoreErrorKind::Cancelled, "operation cancelled")
    }

    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }

    /// Only conflicts are worth another attempt
    pub fn is_temporary(&self) -> bool {
        self.kind == StoreErrorKind::Conflict
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == StoreErrorKind::Cancelled
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Snapshot of one range's reservations plus the version it was read at
#[async_trait]
pub trait IpPool: Send + Sync {
    /// Reservations as read; no side effects
    fn allocations(&self) -> &[IpReservation];

    /// Replace the reservation list if the stored version is unchanged
    async fn update(
        &self,
        reservations: &[IpReservation],
        cancel: &CancellationToken,
    ) -> StoreResult<()>;
}

/// Open backend session
#[async_trait]
pub trait Store: Send + Sync {
    /// Liveness probe
    async fn status(&self, cancel: &CancellationToken) -> StoreResult<()>;

    /// Read the pool for `range`, creating it empty if the backend has none
    async fn get_ip_pool(
        &self,
        range: &IpNet,
        cancel: &CancellationToken,
    ) -> StoreResult<Box<dyn IpPool>>;

    /// Release the session
    async fn close(&self, cancel: &CancellationToken) -> StoreResult<()>;
}

/// Session factory
#[async_trait]
pub trait Backend: Send + Sync {
    async fn open(
        &self,
        config: &IpamConfig,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<Box<dyn Store>>;
}

/// Selects the backend from `config.datastore`
#[derive(Debug, Clone, Copy, Default)]
pub struct DatastoreBackend;

#[async_trait]
impl Backend for DatastoreBackend {
    async fn open(
        &self,
        config: &IpamConfig,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<Box<dyn Store>> {
        match config.datastore {
            Datastore::Etcd => Ok(Box::new(EtcdStore::connect(config, cancel).await?)),
            Datastore::Kubernetes => Ok(Box::new(
                KubernetesStore::connect(config, container_id, cancel).await?,
            )),
        }
    }
}

/// Reject a list holding two entries for one address
pub fn ensure_unique(range: &IpNet, reservations: &[IpReservation]) -> StoreResult<()> {
    let mut seen = HashSet::with_capacity(reservations.len());
    match reservations.iter().find(|r| !seen.insert(r.ip)) {
        Some(dup) => Err(StoreError::permanent(format!(
            "duplicate reservation for {} in pool {}",
            dup.ip, range
        ))),
        None => Ok(()),
    }
}

/// Run `fut` unless `cancel` fires first
pub async fn cancellable<F, T>(cancel: &CancellationToken, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::cancelled()),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_only_conflicts_are_temporary() {
        assert!(StoreError::conflict("moved").is_temporary());
        assert!(!StoreError::permanent("denied").is_temporary());
        assert!(!StoreError::cancelled().is_temporary());
        assert!(StoreError::cancelled().is_cancelled());
    }

    #[test]
    fn test_ensure_unique() {
        let range: IpNet = "10.0.0.0/24".parse().unwrap();
        let ip = "10.0.0.7".parse().unwrap();
        let other = "10.0.0.8".parse().unwrap();

        let distinct = [IpReservation::new(ip, "a", ""), IpReservation::new(other, "a", "")];
        assert!(ensure_unique(&range, &distinct).is_ok());

        let doubled = [IpReservation::new(ip, "a", ""), IpReservation::new(ip, "b", "")];
        let err = ensure_unique(&range, &doubled).unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_cancellable_unblocks_on_cancel() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: StoreResult<()> = cancellable(&token, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), StoreErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_cancellable_passes_result_through() {
        let token = CancellationToken::new();
        let result = cancellable(&token, async { Ok::<_, StoreError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
