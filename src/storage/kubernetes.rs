//! Kubernetes pool store
//!
//! Features:
//! - One namespaced `IPPool` custom resource per range
//! - Allocations keyed by offset from the network address
//! - Optimistic concurrency through `metadata.resourceVersion`
//! - Pools created empty on first use

use crate::allocate::{ip_to_offset, offset_to_ip, IpReservation};
use crate::config::{to_u128, IpamConfig};
use crate::storage::{cancellable, IpPool, Store, StoreError, StoreResult};
use async_trait::async_trait;
use ipnet::IpNet;
use kube::{
    api::{Api, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config, CustomResource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Pool resource spec
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "ipampool.cni.io",
    version = "v1alpha1",
    kind = "IPPool",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IPPoolSpec {
    /// Normalized range, e.g. `192.168.1.0/24`
    pub range: String,

    /// Offset from the network address -> holder
    #[serde(default)]
    pub allocations: BTreeMap<String, IPAllocation>,
}

/// One holder entry in an `IPPool`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IPAllocation {
    pub id: String,
    #[serde(default)]
    pub podref: String,
}

/// Resource name for a range: `10.0.0.0/24` -> `10.0.0.0-24`, `fd00::/64` -> `v6-fd00---64`
///
/// IPv6 names carry a `v6-` prefix so that ranges such as `::/64` still start
/// with an alphanumeric character.
pub fn pool_name(range: &IpNet) -> String {
    match range {
        IpNet::V4(net) => format!("{}-{}", net.network(), net.prefix_len()),
        IpNet::V6(net) => {
            format!("v6-{}-{}", net.network(), net.prefix_len()).replace(':', "-")
        }
    }
}

/// Kubernetes-backed session
#[derive(Clone)]
pub struct KubernetesStore {
    client: Client,
    namespace: String,
}

impl std::fmt::Debug for KubernetesStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesStore")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl KubernetesStore {
    /// Build a client from the configured kubeconfig, or infer one
    #[instrument(skip_all, fields(container_id = %container_id))]
    pub async fn connect(
        config: &IpamConfig,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> StoreResult<Self> {
        let client = cancellable(cancel, async {
            let kube_config = match &config.kubernetes.kubeconfig {
                Some(path) => {
                    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                        StoreError::permanent(format!("reading {}: {}", path.display(), e))
                    })?;
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await
                        .map_err(|e| StoreError::permanent(format!("kubeconfig: {}", e)))?
                }
                None => Config::infer()
                    .await
                    .map_err(|e| StoreError::permanent(format!("kubeconfig: {}", e)))?,
            };
            Client::try_from(kube_config).map_err(classify)
        })
        .await?;

        let namespace = config
            .kubernetes
            .namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());

        debug!(namespace = %namespace, "Kubernetes client ready");
        Ok(Self { client, namespace })
    }

    fn api(&self) -> Api<IPPool> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Fetch the pool, creating it empty when missing
    async fn get_or_create(&self, range: &IpNet) -> StoreResult<IPPool> {
        let api = self.api();
        let name = pool_name(range);

        if let Some(pool) = api.get_opt(&name).await.map_err(classify)? {
            return Ok(pool);
        }

        info!(pool = %name, namespace = %self.namespace, "Creating IPPool");
        let pool = IPPool::new(
            &name,
            IPPoolSpec {
                range: range.to_string(),
                allocations: BTreeMap::new(),
            },
        );
        // A concurrent creator wins with 409, which classifies as a conflict
        api.create(&PostParams::default(), &pool)
            .await
            .map_err(classify)
    }
}

#[async_trait]
impl Store for KubernetesStore {
    async fn status(&self, cancel: &CancellationToken) -> StoreResult<()> {
        cancellable(cancel, async {
            let version = self.client.apiserver_version().await.map_err(classify)?;
            debug!(git_version = %version.git_version, "Kubernetes API server reachable");
            Ok(())
        })
        .await
    }

    async fn get_ip_pool(
        &self,
        range: &IpNet,
        cancel: &CancellationToken,
    ) -> StoreResult<Box<dyn IpPool>> {
        let resource = cancellable(cancel, self.get_or_create(range)).await?;

        let reservations = to_reservations(range, &resource.spec.allocations)?;
        Ok(Box::new(KubernetesPool {
            api: self.api(),
            range: *range,
            resource,
            reservations,
        }))
    }

    async fn close(&self, _cancel: &CancellationToken) -> StoreResult<()> {
        Ok(())
    }
}

/// Snapshot of one `IPPool` at one resource version
pub struct KubernetesPool {
    api: Api<IPPool>,
    range: IpNet,
    resource: IPPool,
    reservations: Vec<IpReservation>,
}

#[async_trait]
impl IpPool for KubernetesPool {
    fn allocations(&self) -> &[IpReservation] {
        &self.reservations
    }

    async fn update(
        &self,
        reservations: &[IpReservation],
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        let mut resource = self.resource.clone();
        resource.spec.allocations = to_allocations(&self.range, reservations)?;
        let name = resource.name_any();

        cancellable(cancel, async {
            // resourceVersion is carried over from the read, so a stale write is rejected with 409
            self.api
                .replace(&name, &PostParams::default(), &resource)
                .await
                .map(|_| ())
                .map_err(classify)
        })
        .await
    }
}

/// Reservations in address order; map keys sort as strings, not offsets
fn to_reservations(
    range: &IpNet,
    allocations: &BTreeMap<String, IPAllocation>,
) -> StoreResult<Vec<IpReservation>> {
    let mut reservations = allocations
        .iter()
        .map(|(offset, allocation)| {
            let offset: u128 = offset.parse().map_err(|e| {
                StoreError::permanent(format!("invalid offset {:?} in pool {}: {}", offset, range, e))
            })?;
            let ip = offset_to_ip(range, offset)
                .map_err(|e| StoreError::permanent(e.to_string()))?;
            Ok(IpReservation::new(ip, allocation.id.clone(), allocation.podref.clone()))
        })
        .collect::<StoreResult<Vec<_>>>()?;
    reservations.sort_by_key(|r| to_u128(r.ip));
    Ok(reservations)
}

fn to_allocations(
    range: &IpNet,
    reservations: &[IpReservation],
) -> StoreResult<BTreeMap<String, IPAllocation>> {
    let mut allocations = BTreeMap::new();
    for reservation in reservations {
        let offset = ip_to_offset(range, reservation.ip)
            .map_err(|e| StoreError::permanent(e.to_string()))?;
        let entry = IPAllocation {
            id: reservation.container_id.clone(),
            podref: reservation.pod_ref.clone(),
        };
        if allocations.insert(offset.to_string(), entry).is_some() {
            return Err(StoreError::permanent(format!(
                "duplicate reservation for {} in pool {}",
                reservation.ip, range
            )));
        }
    }
    Ok(allocations)
}

/// HTTP 409 (stale resourceVersion or concurrent create) is the only temporary error
fn classify(err: kube::Error) -> StoreError {
    match &err {
        kube::Error::Api(response) if response.code == 409 => {
            StoreError::conflict(format!("kubernetes: {}", response.message))
        }
        _ => StoreError::permanent(format!("kubernetes: {}", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreErrorKind;

    fn range() -> IpNet {
        "192.168.1.0/24".parse().unwrap()
    }

    #[test]
    fn test_pool_name() {
        assert_eq!(pool_name(&range()), "192.168.1.0-24");
        assert_eq!(pool_name(&"fd00::/64".parse().unwrap()), "v6-fd00---64");
    }

    #[test]
    fn test_unspecified_ipv6_pool_name_starts_alphanumeric() {
        let name = pool_name(&"::/64".parse().unwrap());
        assert_eq!(name, "v6-----64");
        assert!(name.starts_with(|c: char| c.is_ascii_alphanumeric()));
        assert!(name.ends_with(|c: char| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_allocations_convert_by_offset() {
        let reservations = vec![
            IpReservation::new("192.168.1.5".parse().unwrap(), "a", "ns/a"),
            IpReservation::new("192.168.1.200".parse().unwrap(), "b", "ns/b"),
        ];

        let allocations = to_allocations(&range(), &reservations).unwrap();
        assert_eq!(allocations["5"].id, "a");
        assert_eq!(allocations["200"].podref, "ns/b");

        // "200" sorts before "5" as a key; the read-back list is in address order
        assert_eq!(allocations.keys().next().map(String::as_str), Some("200"));
        let back = to_reservations(&range(), &allocations).unwrap();
        assert_eq!(back, reservations);
    }

    #[test]
    fn test_duplicate_offsets_are_rejected() {
        let ip = "192.168.1.5".parse().unwrap();
        let reservations = vec![IpReservation::new(ip, "a", ""), IpReservation::new(ip, "b", "")];
        let err = to_allocations(&range(), &reservations).unwrap_err();
        assert_eq!(err.kind(), StoreErrorKind::Permanent);
    }

    #[test]
    fn test_malformed_offset_is_permanent() {
        let mut allocations = BTreeMap::new();
        allocations.insert(
            "not-a-number".to_string(),
            IPAllocation {
                id: "a".into(),
                podref: String::new(),
            },
        );
        let err = to_reservations(&range(), &allocations).unwrap_err();
        assert!(!err.is_temporary());
    }

    #[test]
    fn test_conflict_classification() {
        let conflict = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        });
        assert!(classify(conflict).is_temporary());

        let forbidden = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "forbidden".into(),
            reason: "Forbidden".into(),
            code: 403,
        });
        assert_eq!(classify(forbidden).kind(), StoreErrorKind::Permanent);
    }
}
