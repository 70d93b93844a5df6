//! Integration tests for configuration loading

use ipam_pool::{Datastore, IpamConfig};
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn test_dashed_range_end_to_end() {
    let conf = br#"{
        "cniVersion": "0.3.1",
        "name": "mynet",
        "type": "macvlan",
        "ipam": {
            "type": "ipam-pool",
            "etcd_host": "127.0.0.1:2379",
            "range": "192.168.1.5-192.168.1.25/24"
        }
    }"#;

    let (config, _) = IpamConfig::load(conf, None).unwrap();
    assert_eq!(config.cidr().to_string(), "192.168.1.0/24");
    assert_eq!(config.range.start, ip("192.168.1.5"));
    assert_eq!(config.range.end, ip("192.168.1.25"));
}

#[test]
fn test_flat_file_overlay() {
    let mut overlay = tempfile::NamedTempFile::new().unwrap();
    write!(
        overlay,
        r#"{{
            "datastore": "kubernetes",
            "kubernetes": {{
                "kubeconfig": "/etc/cni/net.d/ipam-pool.d/ipam-pool.kubeconfig"
            }},
            "log_file": "/tmp/ipam-pool.log",
            "log_level": "debug",
            "gateway": "192.168.5.5"
        }}"#
    )
    .unwrap();

    let conf = format!(
        r#"{{
            "cniVersion": "0.3.1",
            "name": "mynet",
            "type": "ipvlan",
            "master": "foo0",
            "ipam": {{
                "configuration_path": "{}",
                "type": "ipam-pool",
                "range": "192.168.2.230/24",
                "range_start": "192.168.2.223",
                "gateway": "192.168.10.1",
                "lease_duration": 15,
                "backoff": 1500,
                "request_timeout": 3
            }}
        }}"#,
        overlay.path().display()
    );

    let (config, version) = IpamConfig::load(conf.as_bytes(), None).unwrap();
    assert_eq!(version, "0.3.1");
    assert_eq!(config.log_level.as_deref(), Some("debug"));
    assert_eq!(config.log_file, Some(PathBuf::from("/tmp/ipam-pool.log")));
    assert_eq!(config.cidr().to_string(), "192.168.2.0/24");
    assert_eq!(config.range.start, ip("192.168.2.223"));
    // The attachment document wins over the overlay
    assert_eq!(config.range.gateway, Some(ip("192.168.10.1")));
    assert_eq!(config.datastore, Datastore::Kubernetes);
    assert_eq!(
        config.kubernetes.kubeconfig,
        Some(PathBuf::from("/etc/cni/net.d/ipam-pool.d/ipam-pool.kubeconfig"))
    );
    assert_eq!(config.lease_duration, 15);
    assert_eq!(config.backoff, 1500);
    assert_eq!(config.request_timeout, Duration::from_secs(3));
    assert_eq!(config.lock_request_timeout, Duration::from_secs(10));
}

#[test]
fn test_overlay_passed_by_caller() {
    let mut overlay = tempfile::NamedTempFile::new().unwrap();
    write!(overlay, r#"{{"etcd_host": "etcd-0:2379,etcd-1:2379", "exclude": ["10.9.0.0/28"]}}"#)
        .unwrap();

    let conf = br#"{"ipam": {"range": "10.9.0.0/24"}}"#;
    let (config, _) = IpamConfig::load(conf, Some(overlay.path())).unwrap();

    assert_eq!(
        config.etcd.endpoints(),
        vec!["http://etcd-0:2379".to_string(), "http://etcd-1:2379".to_string()]
    );
    assert_eq!(config.range.exclude.len(), 1);
    assert!(config.range.is_excluded(ip("10.9.0.3")));
}

#[test]
fn test_invalid_range_is_rejected() {
    let conf = br#"{"ipam": {"range": "192.168.1.40-192.168.1.20/24", "etcd_host": "foo"}}"#;
    assert!(IpamConfig::load(conf, None).is_err());
}
