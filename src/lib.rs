//! Weighted distributed lock and KV watch client backed by Consul.
//!
//! Automatic master election for sharded database clusters: every replica
//! runs a lock contender with a configurable weight, the highest-weight
//! live contender wins the master role, and a per-lock delay dampens
//! needless failover churn. Liveness comes from Consul sessions (TTL
//! leases), mutual exclusion from CAS writes on a single lock key, and
//! change detection from long-polling blocking queries.
//!
//! ```ignore
//! use consul_wlock::{Config, WLock};
//! use tokio_util::sync::CancellationToken;
//!
//! let mut config = Config::new("cluster/replicaset-a", 10.0);
//! config.apply_env();
//! let lock: WLock = config.build_lock()?;
//!
//! let done = CancellationToken::new();
//! if lock.acquire(done.clone()).await {
//!     // this replica is master until `done` closes
//!     done.cancelled().await;
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod http;
pub mod kv;
pub mod lock;
mod rate_limiter;
pub mod session;
pub mod watch;

pub use config::{Config, ConfigError};
pub use error::{Error, Result};
pub use http::HttpClient;
pub use kv::{GetOptions, KvClient, KvEntry, PutOptions};
pub use lock::{WLock, WLockOptions};
pub use session::{SessionBehavior, SessionClient, SessionHandle};
pub use watch::{spawn_watch, WatchConfig, WatchHandle};
