//! etcd pool store
//!
//! Each range lives under a single key, `<prefix>/ranges/<network>-<len>`,
//! holding the JSON-encoded reservation list. Updates are transactions that
//! compare the key's mod revision against the revision the snapshot was read
//! at; an absent key compares against revision zero.

use crate::allocate::IpReservation;
use crate::config::IpamConfig;
use crate::storage::{cancellable, ensure_unique, IpPool, Store, StoreError, StoreResult};
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, ConnectOptions, Txn, TxnOp};
use ipnet::IpNet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// etcd-backed session
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    prefix: String,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl EtcdStore {
    /// Connect to the endpoints in `config.etcd`
    #[instrument(skip_all, fields(host = %config.etcd.host))]
    pub async fn connect(config: &IpamConfig, cancel: &CancellationToken) -> StoreResult<Self> {
        let endpoints = config.etcd.endpoints();
        if endpoints.is_empty() {
            return Err(StoreError::permanent("no etcd endpoints configured"));
        }

        let mut options = ConnectOptions::new().with_keep_alive(
            Duration::from_secs(config.lease_duration.max(1)),
            Duration::from_millis(config.backoff.max(1)),
        );
        if let (Some(user), Some(password)) = (&config.etcd.username, &config.etcd.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let client = cancellable(cancel, async {
            Client::connect(endpoints, Some(options))
                .await
                .map_err(classify)
        })
        .await?;

        debug!("Connected to etcd");
        Ok(Self {
            client,
            prefix: config.etcd.prefix.trim_end_matches('/').to_string(),
        })
    }
}

/// `<prefix>/ranges/<network>-<len>`
fn pool_key(prefix: &str, range: &IpNet) -> String {
    format!("{}/ranges/{}-{}", prefix, range.network(), range.prefix_len())
}

fn decode_pool(key: &str, value: &[u8]) -> StoreResult<Vec<IpReservation>> {
    serde_json::from_slice(value)
        .map_err(|e| StoreError::permanent(format!("malformed pool at {}: {}", key, e)))
}

#[async_trait]
impl Store for EtcdStore {
    async fn status(&self, cancel: &CancellationToken) -> StoreResult<()> {
        let mut client = self.client.clone();
        cancellable(cancel, async move {
            let status = client.status().await.map_err(classify)?;
            debug!(version = status.version(), "etcd status");
            Ok(())
        })
        .await
    }

    async fn get_ip_pool(
        &self,
        range: &IpNet,
        cancel: &CancellationToken,
    ) -> StoreResult<Box<dyn IpPool>> {
        let key = pool_key(&self.prefix, range);
        let mut client = self.client.clone();

        let response = cancellable(cancel, async {
            client.get(key.as_str(), None).await.map_err(classify)
        })
        .await?;

        let (revision, reservations) = match response.kvs().first() {
            Some(kv) => (kv.mod_revision(), decode_pool(&key, kv.value())?),
            None => (0, Vec::new()),
        };

        Ok(Box::new(EtcdPool {
            client: self.client.clone(),
            range: *range,
            key,
            revision,
            reservations,
        }))
    }

    async fn close(&self, _cancel: &CancellationToken) -> StoreResult<()> {
        // The gRPC channel shuts down when the last client clone drops
        Ok(())
    }
}

/// Snapshot of one key at one mod revision
pub struct EtcdPool {
    client: Client,
    range: IpNet,
    key: String,
    revision: i64,
    reservations: Vec<IpReservation>,
}

#[async_trait]
impl IpPool for EtcdPool {
    fn allocations(&self) -> &[IpReservation] {
        &self.reservations
    }

    async fn update(
        &self,
        reservations: &[IpReservation],
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        ensure_unique(&self.range, reservations)?;
        let value = serde_json::to_vec(reservations)
            .map_err(|e| StoreError::permanent(format!("encoding pool {}: {}", self.key, e)))?;
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                self.key.as_str(),
                CompareOp::Equal,
                self.revision,
            )])
            .and_then(vec![TxnOp::put(self.key.as_str(), value, None)]);

        let mut client = self.client.clone();
        let response = cancellable(cancel, async move {
            client.txn(txn).await.map_err(classify)
        })
        .await?;

        if response.succeeded() {
            Ok(())
        } else {
            Err(StoreError::conflict(format!(
                "{} changed since revision {}",
                self.key, self.revision
            )))
        }
    }
}

/// Transport and server errors are never retried; conflicts surface as failed transactions
fn classify(err: etcd_client::Error) -> StoreError {
    StoreError::permanent(format!("etcd: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreErrorKind;

    #[test]
    fn test_pool_key() {
        let v4: IpNet = "192.168.1.0/24".parse().unwrap();
        let v6: IpNet = "fd00::/64".parse().unwrap();
        assert_eq!(pool_key("/ipam-pool", &v4), "/ipam-pool/ranges/192.168.1.0-24");
        assert_eq!(pool_key("/ipam-pool", &v6), "/ipam-pool/ranges/fd00::-64");
    }

    #[test]
    fn test_decode_pool() {
        let value = br#"[{"ip": "192.168.1.5", "id": "c1", "podref": "default/web-0"}]"#;
        let reservations = decode_pool("k", value).unwrap();
        assert_eq!(
            reservations,
            vec![IpReservation::new("192.168.1.5".parse().unwrap(), "c1", "default/web-0")]
        );
    }

    #[test]
    fn test_malformed_pool_is_permanent() {
        let err = decode_pool("/ipam-pool/ranges/10.0.0.0-24", b"{not json").unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::Permanent);
        assert!(err.to_string().contains("/ipam-pool/ranges/10.0.0.0-24"));
    }
}
