//! Long-poll watcher over a key or key prefix.
//!
//! One background loop per subscription: blocking reads against the last
//! seen index, change callbacks deduplicated against the previous result,
//! token-bucket pacing, and a 2 s cancellable backoff after failures. The
//! returned handle stops the loop through a [`CancellationToken`]; stopping
//! twice is a no-op.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::kv::{GetOptions, KvClient, KvEntry};
use crate::rate_limiter::TokenBucket;

/// Long-poll duration when the subscription does not override it.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(20);

const ERROR_BACKOFF: Duration = Duration::from_secs(2);

const DEFAULT_RATE_LIMIT: f64 = 1.0;
const DEFAULT_RATE_LIMIT_BURST: u32 = 10;
const DEFAULT_RATE_LIMIT_INIT_BURST: u32 = 5;

/// Subscription parameters for [`spawn_watch`].
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Key, or prefix when `prefix` is set.
    pub key: String,
    /// Watch every entry under `key`.
    pub prefix: bool,
    /// Use consistent (leader-verified) reads.
    pub consistent: bool,
    /// Long-poll duration per iteration.
    pub wait: Duration,
    /// Steady iteration rate in calls per second.
    pub rate_limit: f64,
    /// Token bucket capacity.
    pub rate_limit_burst: u32,
    /// Tokens available at startup.
    pub rate_limit_init_burst: u32,
    /// Resume blocking queries from this index instead of a fresh read.
    pub index: Option<u64>,
}

impl WatchConfig {
    /// Subscription for `key` with the default wait and rate limits.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            prefix: false,
            consistent: false,
            wait: DEFAULT_WAIT,
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_limit_burst: DEFAULT_RATE_LIMIT_BURST,
            rate_limit_init_burst: DEFAULT_RATE_LIMIT_INIT_BURST,
            index: None,
        }
    }
}

/// Invoked with the parsed entries and the response index whenever the
/// observed result differs from the previous one.
pub type ChangeCallback = Box<dyn FnMut(Vec<KvEntry>, u64) + Send>;

/// Invoked once per failed iteration, before the backoff sleep.
pub type ErrorCallback = Box<dyn FnMut(&Error) + Send>;

/// Stop handle for a running watch loop.
#[derive(Debug)]
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Ask the loop to exit. Idempotent; the loop notices after its current
    /// network wakeup.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// The completion signal backing [`WatchHandle::stop`], for linking into
    /// a larger cancellation tree.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait for the loop task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Start a watch loop; `on_error` defaults to a `tracing` warning.
pub fn spawn_watch(
    kv: KvClient,
    config: WatchConfig,
    on_change: ChangeCallback,
    on_error: Option<ErrorCallback>,
) -> WatchHandle {
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_watch_loop(
        kv,
        config,
        on_change,
        on_error,
        cancel.clone(),
    ));
    WatchHandle { cancel, task }
}

async fn run_watch_loop(
    kv: KvClient,
    config: WatchConfig,
    mut on_change: ChangeCallback,
    mut on_error: Option<ErrorCallback>,
    cancel: CancellationToken,
) {
    let mut bucket = TokenBucket::new(
        config.rate_limit,
        config.rate_limit_burst,
        config.rate_limit_init_burst,
    );
    let mut remembered: Option<u64> = config.index;
    let mut previous: Option<Vec<KvEntry>> = None;
    let mut errored = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = bucket.acquire() => {}
        }

        if errored {
            // force a fresh, non-blocking full read after a failure
            remembered = Some(0);
        }

        let options = GetOptions {
            wait: Some(config.wait),
            index: remembered,
            prefix: config.prefix,
            consistent: config.consistent,
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = kv.get(&config.key, options) => result,
        };

        match result {
            Ok((entries, index)) => {
                errored = false;
                if remembered.is_some_and(|prev| index < prev) {
                    // stale-server protection: the index must never move
                    // backwards, so drop this response and refetch from zero
                    warn!(
                        key = %config.key,
                        index,
                        "blocking-query index went backwards, resetting"
                    );
                    remembered = Some(0);
                    continue;
                }
                let changed = remembered.is_none_or(|prev| index != prev)
                    || previous.as_ref().is_none_or(|prev| *prev != entries);
                remembered = Some(index);
                if changed {
                    debug!(
                        key = %config.key,
                        index,
                        entries = entries.len(),
                        "watched key changed"
                    );
                    on_change(entries.clone(), index);
                    previous = Some(entries);
                }
            }
            Err(err) => {
                match &mut on_error {
                    Some(callback) => callback(&err),
                    None => warn!(key = %config.key, error = %err, "watch iteration failed"),
                }
                errored = true;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
    debug!(key = %config.key, "watch loop stopped");
}
