//! Allocation orchestrator
//!
//! Drives one add/delete event through
//! `AcquireBackend -> HealthCheck -> RetryLoop{Read -> Compute -> Commit} -> Release`.
//!
//! Each phase runs under its own child [`CancellationToken`]:
//! - acquire: backend construction and the health probe (`lock_request_timeout`)
//! - operate: the whole retry loop (`request_timeout`)
//! - release: session close (`close_timeout`), detached from the caller so a
//!   cancelled call still closes its session
//!
//! Only conflicts reported by the backend's conditional write send the loop
//! around again. Every retry re-reads and recomputes; a computation is never
//! reused across attempts.

mod deadline;

pub use deadline::Deadline;

use crate::allocate::{assign, release};
use crate::config::IpamConfig;
use crate::error::{Error, Interruption, Phase, Result};
use crate::storage::{Backend, DatastoreBackend, Store};
use ipnet::IpNet;
use metrics::counter;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// What the caller wants done with its container's address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Allocate,
    Deallocate,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Allocate => "allocate",
            Mode::Deallocate => "deallocate",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    /// Accepts CNI commands (`ADD`, `DEL`) and the mode names
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "ADD" | "allocate" => Ok(Mode::Allocate),
            "DEL" | "deallocate" => Ok(Mode::Deallocate),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}

/// Orchestrator bound to one configuration snapshot
#[derive(Clone)]
pub struct IpamManager {
    config: Arc<IpamConfig>,
    backend: Arc<dyn Backend>,
}

impl fmt::Debug for IpamManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpamManager")
            .field("range", &self.config.cidr())
            .field("datastore", &self.config.datastore)
            .finish()
    }
}

impl IpamManager {
    /// Orchestrator using the datastore named in `config`
    pub fn new(config: IpamConfig) -> Self {
        Self::with_backend(config, DatastoreBackend)
    }

    pub fn with_backend(config: IpamConfig, backend: impl Backend + 'static) -> Self {
        Self {
            config: Arc::new(config),
            backend: Arc::new(backend),
        }
    }

    pub fn config(&self) -> &IpamConfig {
        &self.config
    }

    /// Allocate or release the address for `container_id`
    ///
    /// Returns the assigned address for [`Mode::Allocate`] and `None` for
    /// [`Mode::Deallocate`]. The backend session is closed exactly once,
    /// whatever the outcome; a close failure is logged and never replaces
    /// the result.
    #[instrument(skip(self, cancel), fields(range = %self.config.cidr(), datastore = %self.config.datastore))]
    pub async fn manage(
        &self,
        mode: Mode,
        container_id: &str,
        pod_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IpNet>> {
        debug!("IPAM manage");

        let acquire = Deadline::new(cancel, self.config.lock_request_timeout);
        let store = match self
            .backend
            .open(&self.config, container_id, acquire.token())
            .await
        {
            Ok(store) => store,
            Err(e) if e.is_cancelled() => {
                self.record(mode, false);
                return Err(interrupted(&acquire, Phase::Acquire, None, None));
            }
            Err(e) => {
                error!(error = %e, "IPAM {} client initialization error", self.config.datastore);
                self.record(mode, false);
                return Err(Error::BackendInit {
                    datastore: self.config.datastore.to_string(),
                    source: e,
                });
            }
        };

        let result = self
            .operate(store.as_ref(), &acquire, mode, container_id, pod_ref, cancel)
            .await;
        drop(acquire);

        self.close(store.as_ref()).await;
        self.record(mode, result.is_ok());

        match &result {
            Ok(Some(address)) => info!(%address, "Allocated address"),
            Ok(None) => info!("Released address"),
            Err(e) => error!(error = %e, "IPAM {} failed", mode),
        }
        result
    }

    async fn operate(
        &self,
        store: &dyn Store,
        acquire: &Deadline,
        mode: Mode,
        container_id: &str,
        pod_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<IpNet>> {
        if let Err(e) = store.status(acquire.token()).await {
            if e.is_cancelled() {
                return Err(interrupted(acquire, Phase::Acquire, None, None));
            }
            error!(error = %e, "IPAM connectivity error");
            return Err(Error::HealthCheck(e));
        }

        let range = self.config.cidr();
        let operate = Deadline::new(cancel, self.config.request_timeout);
        let mut last_address: Option<IpNet> = None;
        let mut last_error: Option<Error> = None;

        for attempt in 0..self.config.datastore_retries {
            if operate.interruption().is_some() {
                error!(
                    last_address = ?last_address,
                    "Operate phase ended for pool {}, returning last state", range
                );
                return Err(operate_interrupted(&operate, range, last_address, last_error));
            }

            let pool = match store.get_ip_pool(&range, operate.token()).await {
                Ok(pool) => pool,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    let err = Error::Store {
                        range,
                        attempt,
                        source: e,
                    };
                    if err.is_temporary() {
                        warn!(attempt, error = %err, "IPAM conflict reading pool, retrying");
                        last_error = Some(err);
                        continue;
                    }
                    error!(attempt, error = %err, "IPAM error reading pool allocations");
                    return Err(err);
                }
            };

            let computed = match mode {
                Mode::Allocate => assign(&self.config, pool.allocations(), container_id, pod_ref)
                    .map(|(address, updated)| (Some(address), updated)),
                Mode::Deallocate => release(range, pool.allocations(), container_id)
                    .map(|updated| (None, updated)),
            };
            let (address, updated) = match computed {
                Ok(computed) => computed,
                Err(e) => {
                    error!(error = %e, "Error computing {} for pool {}", mode, range);
                    return Err(e);
                }
            };
            last_address = address;

            match pool.update(&updated, operate.token()).await {
                Ok(()) => {
                    debug!(attempt, "Committed pool {}", range);
                    return Ok(address);
                }
                Err(e) if e.is_cancelled() => continue,
                Err(e) if e.is_temporary() => {
                    warn!(attempt, error = %e, "IPAM conflict updating pool {}, retrying", range);
                    counter!("ipam_pool_update_conflicts_total").increment(1);
                    last_error = Some(Error::Store {
                        range,
                        attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    error!(attempt, error = %e, "IPAM error updating pool {}", range);
                    return Err(Error::Store {
                        range,
                        attempt,
                        source: e,
                    });
                }
            }
        }

        if operate.interruption().is_some() {
            return Err(operate_interrupted(&operate, range, last_address, last_error));
        }
        match last_error {
            Some(err) => {
                error!(
                    retries = self.config.datastore_retries,
                    "Retry budget spent for pool {}", range
                );
                Err(err)
            }
            None => Err(Error::NoAttempt {
                range,
                reason: format!(
                    "retry budget of {} attempts allowed no attempt",
                    self.config.datastore_retries
                ),
            }),
        }
    }

    /// Close under a deadline the caller cannot cancel
    async fn close(&self, store: &dyn Store) {
        let release = Deadline::detached(self.config.close_timeout);
        if let Err(e) = store.close(release.token()).await {
            if e.is_cancelled() {
                let err = interrupted(&release, Phase::Release, None, None);
                error!(error = %err, "Error in closing ipam pool");
            } else {
                error!(error = %e, "Error in closing ipam pool");
            }
            counter!("ipam_pool_close_failures_total").increment(1);
        }
    }

    fn record(&self, mode: Mode, ok: bool) {
        counter!(
            "ipam_pool_operations_total",
            "mode" => mode.as_str(),
            "outcome" => if ok { "ok" } else { "error" }
        )
        .increment(1);
    }
}

fn interrupted(
    deadline: &Deadline,
    phase: Phase,
    last_address: Option<IpNet>,
    last_error: Option<Error>,
) -> Error {
    Error::Interrupted {
        phase,
        reason: deadline
            .interruption()
            .unwrap_or(Interruption::Cancelled),
        last_address,
        last_error: last_error.map(Box::new),
    }
}

/// Operate phase ended early; with nothing attempted there is no last state to report
fn operate_interrupted(
    operate: &Deadline,
    range: IpNet,
    last_address: Option<IpNet>,
    last_error: Option<Error>,
) -> Error {
    if last_address.is_none() && last_error.is_none() {
        let reason = operate.interruption().unwrap_or(Interruption::Cancelled);
        return Error::NoAttempt {
            range,
            reason: format!("{} phase {}", Phase::Operate, reason),
        };
    }
    interrupted(operate, Phase::Operate, last_address, last_error)
}

/// One-shot entry point using the datastore named in `config`
pub async fn manage(
    mode: Mode,
    config: IpamConfig,
    container_id: &str,
    pod_ref: &str,
) -> Result<Option<IpNet>> {
    IpamManager::new(config)
        .manage(mode, container_id, pod_ref, &CancellationToken::new())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressRange;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn manager(store: &MemoryStore) -> IpamManager {
        let range = AddressRange::parse("192.168.1.5-192.168.1.25/24", None, None, None, vec![])
            .unwrap();
        IpamManager::with_backend(IpamConfig::for_range(range), store.clone())
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("ADD".parse::<Mode>().unwrap(), Mode::Allocate);
        assert_eq!("DEL".parse::<Mode>().unwrap(), Mode::Deallocate);
        assert_eq!("deallocate".parse::<Mode>().unwrap(), Mode::Deallocate);
        assert!(matches!("CHECK".parse::<Mode>(), Err(Error::UnknownMode(_))));
    }

    #[tokio::test]
    async fn test_allocate_then_deallocate() -> Result<()> {
        let store = MemoryStore::new();
        let ipam = manager(&store);
        let token = CancellationToken::new();

        let address = ipam.manage(Mode::Allocate, "c1", "ns/p1", &token).await?;
        assert_eq!(address.map(|a| a.to_string()), Some("192.168.1.5/24".to_string()));

        let address = ipam.manage(Mode::Deallocate, "c1", "ns/p1", &token).await?;
        assert_eq!(address, None);
        assert!(store.reservations(&ipam.config().cidr()).is_empty());

        assert_eq!(store.open_count(), 2);
        assert_eq!(store.close_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_conflict_is_retried() -> Result<()> {
        let store = MemoryStore::new();
        store.force_conflicts(3);
        let ipam = manager(&store);

        let address = ipam
            .manage(Mode::Allocate, "c1", "", &CancellationToken::new())
            .await?;
        assert!(address.is_some());
        assert_eq!(store.update_count(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_unhealthy_backend_is_fatal() {
        let store = MemoryStore::new();
        store.set_unhealthy("connection refused");
        let ipam = manager(&store);

        let err = ipam
            .manage(Mode::Allocate, "c1", "", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HealthCheck(_)));
        assert_eq!(store.status_count(), 1);
        assert_eq!(store.update_count(), 0);
        assert_eq!(store.close_count(), 1);
    }

    #[tokio::test]
    async fn test_zero_budget_reports_no_attempt() {
        let store = MemoryStore::new();
        let mut config = manager(&store).config().clone();
        config.datastore_retries = 0;
        let ipam = IpamManager::with_backend(config, store.clone());

        let err = ipam
            .manage(Mode::Allocate, "c1", "", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAttempt { .. }));
        assert_eq!(store.close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_operate_deadline_reports_no_attempt() {
        let store = MemoryStore::new();
        let mut config = manager(&store).config().clone();
        config.request_timeout = Duration::ZERO;
        let ipam = IpamManager::with_backend(config, store.clone());

        let err = ipam
            .manage(Mode::Allocate, "c1", "", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::NoAttempt { range, reason } => {
                assert_eq!(range.to_string(), "192.168.1.0/24");
                assert_eq!(reason, "operate phase deadline exceeded");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(store.update_count(), 0);
        assert_eq!(store.close_count(), 1);
    }
}
