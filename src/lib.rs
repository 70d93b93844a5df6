// ipam-pool - IP address management for container network attachments
// Optimistic-concurrency allocation over etcd or Kubernetes

#![warn(rust_2018_idioms)]

pub mod allocate;
pub mod config;
pub mod ipam;
pub mod storage;

// Re-exports for convenience
pub use allocate::{assign, release, IpReservation};
pub use config::{AddressRange, Datastore, IpamConfig};
pub use ipam::{manage, IpamManager, Mode};
pub use storage::{Backend, DatastoreBackend, IpPool, MemoryStore, Store, StoreError, StoreErrorKind};

/// ipam-pool error types
pub mod error {
    use crate::storage::StoreError;
    use ipnet::IpNet;
    use std::fmt;
    use thiserror::Error;

    /// Orchestrator phase an interruption happened in
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Phase {
        Acquire,
        Operate,
        Release,
    }

    impl fmt::Display for Phase {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Phase::Acquire => write!(f, "acquire"),
                Phase::Operate => write!(f, "operate"),
                Phase::Release => write!(f, "release"),
            }
        }
    }

    /// Why a phase stopped before finishing
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Interruption {
        DeadlineExceeded,
        Cancelled,
    }

    impl fmt::Display for Interruption {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Interruption::DeadlineExceeded => write!(f, "deadline exceeded"),
                Interruption::Cancelled => write!(f, "cancelled"),
            }
        }
    }

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Unknown IPAM mode: {0}")]
        UnknownMode(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Invalid range: {0}")]
        InvalidRange(String),

        #[error("IPAM {datastore} client initialization error: {source}")]
        BackendInit {
            datastore: String,
            #[source]
            source: StoreError,
        },

        #[error("IPAM connectivity error: {0}")]
        HealthCheck(#[source] StoreError),

        #[error("Could not allocate IP in range {range}: range exhausted")]
        RangeExhausted { range: IpNet },

        #[error("Did not find reserved IP for container {container_id} in range {range}")]
        NotFound { container_id: String, range: IpNet },

        #[error("Invalid reservation data: {0}")]
        InvalidReservation(String),

        #[error("IPAM error on pool {range} (attempt {attempt}): {source}")]
        Store {
            range: IpNet,
            attempt: usize,
            #[source]
            source: StoreError,
        },

        #[error("IPAM {phase} phase {reason}{}", describe_last(.last_address, .last_error))]
        Interrupted {
            phase: Phase,
            reason: Interruption,
            last_address: Option<IpNet>,
            last_error: Option<Box<Error>>,
        },

        #[error("No attempt completed on pool {range} before the loop ended ({reason})")]
        NoAttempt { range: IpNet, reason: String },
    }

    fn describe_last(address: &Option<IpNet>, error: &Option<Box<Error>>) -> String {
        let mut out = String::new();
        if let Some(address) = address {
            out.push_str(&format!(", last address {}", address));
        }
        if let Some(error) = error {
            out.push_str(&format!(", last error: {}", error));
        }
        out
    }

    impl Error {
        /// Whether the loop may retry after this error
        pub fn is_temporary(&self) -> bool {
            match self {
                Error::Store { source, .. } => source.is_temporary(),
                _ => false,
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
