//! Weighted distributed lock with delay dampening.
//!
//! Each participant advertises a session-acquired contender key carrying its
//! weight under a shared prefix; the highest-weight live contender is the
//! one entitled to CAS itself into the `<prefix>/lock` key. A configurable
//! delay holds back preemption of a live holder so transient disagreements
//! between peers do not churn the master role.
//!
//! The public surface is a single blocking [`WLock::acquire`] plus runtime
//! setters for weight and delay. Loss of the lock is reported by closing the
//! same done token the caller may close to release.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{self, Result};
use crate::kv::{KvClient, KvEntry, PutOptions};
use crate::session::{SessionBehavior, SessionClient, SessionHandle};
use crate::watch::{spawn_watch, WatchConfig};

/// Session TTL when the options do not override it.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15);

/// Backoff between attempts to set up the session and contender key.
const SETUP_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// The renewer fires at this fraction of the session TTL.
const RENEW_TICK_RATIO: f64 = 0.66;

const LOCK_SEGMENT: &str = "lock";

/// Constructor options for [`WLock`].
#[derive(Debug, Clone)]
pub struct WLockOptions {
    /// KV prefix under which the lock and contender keys live.
    pub prefix: String,
    /// This participant's weight; the highest live weight wins.
    pub weight: f64,
    /// How long to dampen preemption of a live holder.
    pub delay: Duration,
    /// Opaque payload published alongside weight and holder.
    pub info: Value,
    /// Lease duration for the backing session.
    pub session_ttl: Duration,
    /// Long-poll duration for the prefix watchers.
    pub wait: Duration,
    /// Watcher steady rate, calls per second.
    pub rate_limit: f64,
    /// Watcher token bucket capacity.
    pub rate_limit_burst: u32,
    /// Watcher tokens available at startup.
    pub rate_limit_init_burst: u32,
}

impl WLockOptions {
    /// Options for `prefix` with the given weight, no delay, and the
    /// default session TTL and watcher tuning.
    pub fn new(prefix: impl Into<String>, weight: f64) -> Self {
        let watch_defaults = WatchConfig::new(String::new());
        Self {
            prefix: prefix.into(),
            weight,
            delay: Duration::ZERO,
            info: Value::Null,
            session_ttl: DEFAULT_SESSION_TTL,
            wait: watch_defaults.wait,
            rate_limit: watch_defaults.rate_limit,
            rate_limit_burst: watch_defaults.rate_limit_burst,
            rate_limit_init_burst: watch_defaults.rate_limit_init_burst,
        }
    }
}

/// Value stored in a contender key.
#[derive(Debug, Serialize, Deserialize)]
struct ContenderValue {
    weight: f64,
    info: Value,
}

/// Value stored in the lock key.
#[derive(Debug, Serialize, Deserialize)]
struct LockValue {
    holder: String,
    info: Value,
}

/// What one prefix snapshot says about the race.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PrefixView {
    /// Live contenders by session id.
    pub(crate) contenders: HashMap<String, f64>,
    /// The lock key's holder, only while that holder is a live contender.
    pub(crate) holder: Option<String>,
    /// Highest contender weight, 0 when there are none.
    pub(crate) max_weight: f64,
    /// Modify index of the lock key, 0 when absent. CAS precondition.
    pub(crate) lock_index: u64,
}

/// Pure parse of a prefix snapshot.
///
/// Contender entries must have a well-formed UUID as their last path
/// segment, be acquired by exactly that session, and carry a numeric
/// weight; anything else is ignored. A lock key naming a holder that is
/// not itself a live contender counts as unheld.
pub(crate) fn parse_prefix(prefix: &str, entries: &[KvEntry]) -> PrefixView {
    let lock_key = lock_key(prefix);
    let mut contenders = HashMap::new();
    let mut named_holder = None;
    let mut lock_index = 0;

    for entry in entries {
        if entry.key == lock_key {
            lock_index = entry.modify_index;
            if let Ok(value) = serde_json::from_slice::<LockValue>(&entry.value) {
                named_holder = Some(value.holder);
            }
            continue;
        }
        let Some(segment) = entry
            .key
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('/'))
        else {
            continue;
        };
        if segment.contains('/') || Uuid::parse_str(segment).is_err() {
            continue;
        }
        if entry.session.as_deref() != Some(segment) {
            continue;
        }
        let Ok(value) = serde_json::from_slice::<ContenderValue>(&entry.value) else {
            continue;
        };
        if !value.weight.is_finite() {
            continue;
        }
        contenders.insert(segment.to_string(), value.weight);
    }

    let max_weight = if contenders.is_empty() {
        0.0
    } else {
        contenders
            .values()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    };
    let holder = named_holder.filter(|holder| contenders.contains_key(holder));
    PrefixView {
        contenders,
        holder,
        max_weight,
        lock_index,
    }
}

/// Whether `session_id` may race for the lock given `view`.
///
/// Requires the maximum weight, and a current holder (if any) with strictly
/// smaller weight: an equal-weight incumbent keeps the lock.
pub(crate) fn is_eligible(view: &PrefixView, session_id: &str) -> bool {
    let Some(own) = view.contenders.get(session_id) else {
        return false;
    };
    if *own < view.max_weight {
        return false;
    }
    match &view.holder {
        None => true,
        Some(holder) => view
            .contenders
            .get(holder)
            .is_some_and(|weight| *weight < view.max_weight),
    }
}

fn lock_key(prefix: &str) -> String {
    format!("{prefix}/{LOCK_SEGMENT}")
}

async fn publish_contender(
    kv: &KvClient,
    prefix: &str,
    session_id: &str,
    weight: f64,
    info: &Value,
) -> Result<bool> {
    let value = serde_json::to_vec(&ContenderValue {
        weight,
        info: info.clone(),
    })
    .context(error::EncodeBodySnafu)?;
    kv.put(
        &format!("{prefix}/{session_id}"),
        &value,
        PutOptions {
            cas: None,
            acquire: Some(session_id),
        },
    )
    .await
}

/// Weighted distributed lock over a KV prefix.
///
/// One instance owns at most one backend session at a time. All state
/// transitions of an acquisition are driven by the task inside
/// [`WLock::acquire`]; subordinate tasks (renewer, watchers) communicate
/// exclusively through the done token and watch channels.
pub struct WLock {
    kv: KvClient,
    sessions: SessionClient,
    prefix: String,
    info: Value,
    session_ttl: Duration,
    wait: Duration,
    rate_limit: f64,
    rate_limit_burst: u32,
    rate_limit_init_burst: u32,
    weight: watch::Sender<f64>,
    delay: watch::Sender<Duration>,
}

impl WLock {
    /// Create a lock participant; no network traffic until
    /// [`WLock::acquire`].
    pub fn new(kv: KvClient, sessions: SessionClient, options: WLockOptions) -> Self {
        let (weight, _) = watch::channel(options.weight);
        let (delay, _) = watch::channel(options.delay);
        Self {
            kv,
            sessions,
            prefix: options.prefix,
            info: options.info,
            session_ttl: options.session_ttl,
            wait: options.wait,
            rate_limit: options.rate_limit,
            rate_limit_burst: options.rate_limit_burst,
            rate_limit_init_burst: options.rate_limit_init_burst,
            weight,
            delay,
        }
    }

    /// Consistent prefix-watch subscription with this lock's tuning.
    fn prefix_watch_config(&self) -> WatchConfig {
        let mut config = WatchConfig::new(self.prefix.clone());
        config.prefix = true;
        config.consistent = true;
        config.wait = self.wait;
        config.rate_limit = self.rate_limit;
        config.rate_limit_burst = self.rate_limit_burst;
        config.rate_limit_init_burst = self.rate_limit_init_burst;
        config
    }

    /// Current weight.
    pub fn weight(&self) -> f64 {
        *self.weight.borrow()
    }

    /// Current delay.
    pub fn delay(&self) -> Duration {
        *self.delay.borrow()
    }

    /// Update the weight. An in-flight acquisition re-publishes its
    /// contender key and peers re-evaluate eligibility.
    pub fn set_weight(&self, weight: f64) {
        info!(prefix = %self.prefix, weight, "weight updated");
        self.weight.send_replace(weight);
    }

    /// Update the delay. An in-flight delay wait is truncated or extended
    /// to `max(0, started + delay - now)`.
    pub fn set_delay(&self, delay: Duration) {
        info!(prefix = %self.prefix, delay_secs = delay.as_secs_f64(), "delay updated");
        self.delay.send_replace(delay);
    }

    /// Block until the lock is acquired and being held (`true`), or `done`
    /// is closed (`false`).
    ///
    /// After a `true` return the caller observes loss of the lock (session
    /// invalidation, holder change, or hold-watch failure) as `done`
    /// closing; the session and its contender key are destroyed on every
    /// teardown path.
    pub async fn acquire(&self, done: CancellationToken) -> bool {
        let Some(session) = self.establish(&done).await else {
            return false;
        };

        tokio::spawn(run_renewer(
            self.kv.clone(),
            session.clone(),
            self.prefix.clone(),
            self.info.clone(),
            done.clone(),
            self.weight.subscribe(),
        ));

        loop {
            let Some(lock_index) = self.wait_until_eligible(session.id(), &done).await else {
                return false;
            };
            info!(session = %session.id(), prefix = %self.prefix, "ready to lock");

            match self.try_cas(session.id(), lock_index).await {
                Ok(true) => {
                    info!(session = %session.id(), prefix = %self.prefix, "acquired lock");
                    self.spawn_hold_watch(session.id().to_string(), done.clone());
                    return true;
                }
                Ok(false) => {
                    debug!(session = %session.id(), "lock CAS lost, re-entering wait");
                }
                Err(err) => {
                    warn!(session = %session.id(), error = %err, "lock CAS failed, re-entering wait");
                }
            }
            if done.is_cancelled() {
                return false;
            }
        }
    }

    /// Phase 1: session plus contender key, retried until `done` closes.
    async fn establish(&self, done: &CancellationToken) -> Option<SessionHandle> {
        loop {
            if done.is_cancelled() {
                return None;
            }
            match self.create_session_and_contender().await {
                Ok(Some(session)) => return Some(session),
                Ok(None) => {
                    warn!(prefix = %self.prefix, "contender key held by a foreign session, retrying");
                }
                Err(err) => {
                    warn!(prefix = %self.prefix, error = %err, "session setup failed, retrying");
                }
            }
            tokio::select! {
                _ = done.cancelled() => return None,
                _ = tokio::time::sleep(SETUP_RETRY_BACKOFF) => {}
            }
        }
    }

    async fn create_session_and_contender(&self) -> Result<Option<SessionHandle>> {
        let session = self
            .sessions
            .create(self.session_ttl, SessionBehavior::Delete)
            .await?;
        info!(session = %session.id(), prefix = %self.prefix, "created session");

        let weight = *self.weight.borrow();
        let published =
            publish_contender(&self.kv, &self.prefix, session.id(), weight, &self.info).await;
        match published {
            Ok(true) => Ok(Some(session)),
            Ok(false) => {
                let _ = session.destroy().await;
                Ok(None)
            }
            Err(err) => {
                let _ = session.destroy().await;
                Err(err)
            }
        }
    }

    /// Phase 2: watch the prefix until this session may take the lock.
    ///
    /// Returns the lock key's modify index to CAS against, or `None` when
    /// `done` closed first. With a live holder the delay timer restarts on
    /// every snapshot; with no holder the delay is skipped entirely.
    async fn wait_until_eligible(
        &self,
        session_id: &str,
        done: &CancellationToken,
    ) -> Option<u64> {
        let (snapshot_tx, mut snapshot_rx) =
            watch::channel::<Option<(Vec<KvEntry>, u64)>>(None);
        let watch_config = self.prefix_watch_config();
        let watcher = spawn_watch(
            self.kv.clone(),
            watch_config,
            Box::new(move |entries, index| {
                snapshot_tx.send_replace(Some((entries, index)));
            }),
            None,
        );

        let mut delay_rx = self.delay.subscribe();
        // (started, lock index) of the pending preemption, when delaying
        let mut pending: Option<(Instant, u64)> = None;

        enum Event {
            Cancelled,
            Elapsed(u64),
            DelayChanged,
            Snapshot,
        }

        let outcome = loop {
            let event = match pending {
                Some((started, lock_index)) => {
                    let deadline = started + *delay_rx.borrow();
                    tokio::select! {
                        _ = done.cancelled() => Event::Cancelled,
                        _ = tokio::time::sleep_until(deadline) => Event::Elapsed(lock_index),
                        result = delay_rx.changed() => match result {
                            Ok(()) => Event::DelayChanged,
                            Err(_) => Event::Cancelled,
                        },
                        result = snapshot_rx.changed() => match result {
                            Ok(()) => Event::Snapshot,
                            Err(_) => Event::Cancelled,
                        },
                    }
                }
                None => tokio::select! {
                    _ = done.cancelled() => Event::Cancelled,
                    result = delay_rx.changed() => match result {
                        Ok(()) => Event::DelayChanged,
                        Err(_) => Event::Cancelled,
                    },
                    result = snapshot_rx.changed() => match result {
                        Ok(()) => Event::Snapshot,
                        Err(_) => Event::Cancelled,
                    },
                },
            };

            match event {
                Event::Cancelled => break None,
                Event::Elapsed(lock_index) => break Some(lock_index),
                Event::DelayChanged => {
                    // deadline is recomputed from the original start on the
                    // next loop turn
                    continue;
                }
                Event::Snapshot => {
                    let Some((entries, _)) = snapshot_rx.borrow_and_update().clone() else {
                        continue;
                    };
                    let view = parse_prefix(&self.prefix, &entries);
                    if !is_eligible(&view, session_id) {
                        pending = None;
                        continue;
                    }
                    if view.holder.is_none() || delay_rx.borrow().is_zero() {
                        break Some(view.lock_index);
                    }
                    debug!(
                        session = %session_id,
                        delay_secs = delay_rx.borrow().as_secs_f64(),
                        "eligible with live holder, delaying preemption"
                    );
                    pending = Some((Instant::now(), view.lock_index));
                }
            }
        };

        watcher.stop();
        outcome
    }

    /// Phase 3 write: CAS the lock key against the last seen modify index.
    async fn try_cas(&self, session_id: &str, lock_index: u64) -> Result<bool> {
        let value = serde_json::to_vec(&LockValue {
            holder: session_id.to_string(),
            info: self.info.clone(),
        })
        .context(error::EncodeBodySnafu)?;
        self.kv
            .put(
                &lock_key(&self.prefix),
                &value,
                PutOptions {
                    cas: Some(lock_index),
                    acquire: None,
                },
            )
            .await
    }

    /// Held state: a watcher that closes `done` as soon as a snapshot shows
    /// someone else holding, or the watch itself fails.
    fn spawn_hold_watch(&self, session_id: String, done: CancellationToken) {
        let watch_config = self.prefix_watch_config();
        let prefix = self.prefix.clone();
        let change_done = done.clone();
        let change_session = session_id.clone();
        let error_done = done.clone();
        let watcher = spawn_watch(
            self.kv.clone(),
            watch_config,
            Box::new(move |entries, _| {
                let view = parse_prefix(&prefix, &entries);
                if view.holder.as_deref() != Some(change_session.as_str()) {
                    info!(session = %change_session, "lost lock: holder changed");
                    change_done.cancel();
                }
            }),
            Some(Box::new(move |err| {
                warn!(session = %session_id, error = %err, "hold watch failed");
                error_done.cancel();
            })),
        );

        tokio::spawn(async move {
            done.cancelled().await;
            watcher.stop();
            watcher.join().await;
        });
    }
}

/// Background lease keeper for one acquisition.
///
/// Sleeps `0.66 * ttl` between renewals, waking early when the weight
/// changes (re-publish the contender key) or `done` closes. Renewal
/// failure and re-publish failure both close `done`; teardown always
/// attempts to destroy the session, which deletes the contender key.
async fn run_renewer(
    kv: KvClient,
    session: SessionHandle,
    prefix: String,
    info: Value,
    done: CancellationToken,
    mut weight_rx: watch::Receiver<f64>,
) {
    let tick = session.ttl().mul_f64(RENEW_TICK_RATIO);
    let mut published = *weight_rx.borrow();
    let mut track_weight = true;

    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = tokio::time::sleep(tick) => {
                match session.renew().await {
                    Ok(true) => {
                        debug!(session = %session.id(), "session renewed");
                    }
                    Ok(false) => {
                        warn!(session = %session.id(), "session invalidated by backend");
                        done.cancel();
                        break;
                    }
                    Err(err) => {
                        warn!(session = %session.id(), error = %err, "session renew failed");
                        done.cancel();
                        break;
                    }
                }
            }
            result = weight_rx.changed(), if track_weight => {
                if result.is_err() {
                    track_weight = false;
                    continue;
                }
                let current = *weight_rx.borrow_and_update();
                if current == published {
                    continue;
                }
                match publish_contender(&kv, &prefix, session.id(), current, &info).await {
                    Ok(true) => {
                        info!(session = %session.id(), weight = current, "re-published contender weight");
                        published = current;
                    }
                    Ok(false) => {
                        warn!(session = %session.id(), "contender re-publish rejected");
                        done.cancel();
                        break;
                    }
                    Err(err) => {
                        warn!(session = %session.id(), error = %err, "contender re-publish failed");
                        done.cancel();
                        break;
                    }
                }
            }
        }
    }

    match session.destroy().await {
        Ok(true) => info!(session = %session.id(), "released and deleted session"),
        Ok(false) => debug!(session = %session.id(), "session already gone at destroy"),
        Err(err) => warn!(session = %session.id(), error = %err, "session destroy failed"),
    }
}
