//! Bootstrap controller: brings the anonymizing transport and overlay online.
//!
//! `enable()` is idempotent and coalescing. The first caller spawns one
//! attempt task; everyone who arrives while it runs waits on the same
//! `watch` channel and receives the same outcome. The attempt retries with
//! exponential backoff, bounded per try by the bootstrap timeout.
//!
//! `disable()` bumps the generation, aborts any in-flight attempt and waits
//! for it to finish before tearing the transport down. Until that drain
//! completes the controller reports `Disabled`, and a new `enable()` waits
//! for the drain before it starts a fresh attempt.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use veil_core::config::TransportConfig;
use veil_core::BootstrapError;

use crate::bus::{EventBus, SessionEvent};
use crate::retry::Backoff;
use crate::transport::{PeerEventSink, Transport};

/// Externally visible controller state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapPhase {
    Disabled,
    Enabling,
    Enabled,
    /// Disabled after the last attempt exhausted its retries.
    Failed(BootstrapError),
}

#[derive(Debug, Clone)]
pub struct BootstrapPolicy {
    /// Bound on a single bring-up try.
    pub timeout: Duration,
    /// Extra tries after the first one.
    pub retries: u32,
    pub backoff: Backoff,
    pub anonymize: bool,
}

impl BootstrapPolicy {
    pub fn from_config(config: &TransportConfig) -> Self {
        let base = config.bootstrap_backoff();
        Self {
            timeout: config.bootstrap_timeout(),
            retries: config.bootstrap_retries,
            backoff: Backoff::new(base, base.saturating_mul(16)),
            anonymize: config.anonymize,
        }
    }
}

type Outcome = Option<Result<(), BootstrapError>>;

enum ControlState {
    Disabled,
    Enabling {
        generation: u64,
        done: watch::Receiver<Outcome>,
        attempt: JoinHandle<()>,
    },
    Enabled,
    /// Teardown in progress; flips to `true` once the transport is down.
    Disabling {
        drained: watch::Receiver<bool>,
    },
    Failed(BootstrapError),
}

impl ControlState {
    fn phase(&self) -> BootstrapPhase {
        match self {
            ControlState::Disabled | ControlState::Disabling { .. } => BootstrapPhase::Disabled,
            ControlState::Enabling { .. } => BootstrapPhase::Enabling,
            ControlState::Enabled => BootstrapPhase::Enabled,
            ControlState::Failed(e) => BootstrapPhase::Failed(e.clone()),
        }
    }
}

enum Step {
    Start(watch::Receiver<Outcome>),
    Attach(watch::Receiver<Outcome>),
    Drain(watch::Receiver<bool>),
}

struct Inner {
    transport: Arc<dyn Transport>,
    events: PeerEventSink,
    bus: EventBus<SessionEvent>,
    policy: Mutex<BootstrapPolicy>,
    state: Mutex<ControlState>,
    enabled: AtomicBool,
    /// Anonymize flag of the bring-up that last committed.
    anonymizing: AtomicBool,
    generation: AtomicU64,
    /// Underlying `bring_up` calls, across all attempts.
    tries: AtomicU64,
    version: AtomicU64,
}

#[derive(Clone)]
pub struct BootstrapController {
    inner: Arc<Inner>,
}

impl BootstrapController {
    pub fn new(
        transport: Arc<dyn Transport>,
        events: PeerEventSink,
        bus: EventBus<SessionEvent>,
        policy: BootstrapPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                events,
                bus,
                policy: Mutex::new(policy),
                state: Mutex::new(ControlState::Disabled),
                enabled: AtomicBool::new(false),
                anonymizing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                tries: AtomicU64::new(0),
                version: AtomicU64::new(0),
            }),
        }
    }

    pub async fn enable(&self) -> Result<(), BootstrapError> {
        self.enable_with_deadline(None).await
    }

    /// Like `enable`, but this caller stops waiting after `deadline` and
    /// gets `Timeout`. The shared attempt keeps running for other waiters.
    pub async fn enable_with_deadline(
        &self,
        deadline: Option<Duration>,
    ) -> Result<(), BootstrapError> {
        let run = async {
            loop {
                let step = {
                    let mut state = self.inner.state.lock();
                    match &*state {
                        ControlState::Enabled => return Ok(()),
                        ControlState::Enabling { done, .. } => Step::Attach(done.clone()),
                        ControlState::Disabling { drained } => Step::Drain(drained.clone()),
                        ControlState::Disabled | ControlState::Failed(_) => {
                            let generation =
                                self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                            let (tx, rx) = watch::channel(None);
                            let attempt =
                                tokio::spawn(run_attempt(self.inner.clone(), generation, tx));
                            *state = ControlState::Enabling {
                                generation,
                                done: rx.clone(),
                                attempt,
                            };
                            self.inner.version.fetch_add(1, Ordering::SeqCst);
                            Step::Start(rx)
                        }
                    }
                };

                let mut done = match step {
                    Step::Drain(mut drained) => {
                        tracing::debug!("bootstrap still tearing down, waiting");
                        let _ = drained.wait_for(|d| *d).await;
                        continue;
                    }
                    Step::Start(done) => {
                        tracing::info!("bootstrap starting");
                        self.inner
                            .bus
                            .publish(&SessionEvent::Bootstrap(BootstrapPhase::Enabling));
                        done
                    }
                    Step::Attach(done) => {
                        tracing::debug!("bootstrap already in flight, attaching");
                        done
                    }
                };

                return match done.wait_for(|o| o.is_some()).await {
                    Ok(outcome) => outcome.clone().unwrap_or(Err(BootstrapError::Timeout)),
                    Err(_) => Err(BootstrapError::TransportUnavailable(
                        "bootstrap disabled while enabling".into(),
                    )),
                };
            }
        };
        match deadline {
            None => run.await,
            Some(d) => tokio::time::timeout(d, run)
                .await
                .unwrap_or(Err(BootstrapError::Timeout)),
        }
    }

    /// Tear down. No-op when already disabled. Returns once the transport
    /// is down and no attempt of an earlier enable is still running.
    pub async fn disable(&self) {
        let drain = {
            let mut state = self.inner.state.lock();
            match &*state {
                ControlState::Disabled => return,
                ControlState::Disabling { drained } => Err(drained.clone()),
                _ => {
                    self.inner.generation.fetch_add(1, Ordering::SeqCst);
                    self.inner.enabled.store(false, Ordering::SeqCst);
                    self.inner.version.fetch_add(1, Ordering::SeqCst);
                    let (tx, rx) = watch::channel(false);
                    let previous =
                        std::mem::replace(&mut *state, ControlState::Disabling { drained: rx });
                    // Spawned so the teardown finishes even if this caller is dropped.
                    Ok(tokio::spawn(drain(self.inner.clone(), previous, tx)))
                }
            }
        };

        match drain {
            Ok(task) => {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "bootstrap teardown task failed");
                }
            }
            Err(mut drained) => {
                let _ = drained.wait_for(|d| *d).await;
            }
        }
    }

    /// Non-blocking gate checked by transfers and the directory.
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> BootstrapPhase {
        self.inner.state.lock().phase()
    }

    /// Error recorded by the last failed attempt, until the next enable/disable.
    pub fn last_error(&self) -> Option<BootstrapError> {
        match &*self.inner.state.lock() {
            ControlState::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Total `bring_up` calls made.
    pub fn tries(&self) -> u64 {
        self.inner.tries.load(Ordering::SeqCst)
    }

    /// Takes effect on the next enable.
    pub fn set_anonymize(&self, anonymize: bool) {
        self.inner.policy.lock().anonymize = anonymize;
    }

    /// Configured flag for the next bring-up.
    pub fn anonymize(&self) -> bool {
        self.inner.policy.lock().anonymize
    }

    /// Whether the transport that is up right now was brought up anonymized.
    pub fn anonymizing(&self) -> bool {
        self.is_enabled() && self.inner.anonymizing.load(Ordering::SeqCst)
    }

    /// Bumped on every phase change.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::SeqCst)
    }
}

async fn drain(inner: Arc<Inner>, previous: ControlState, drained: watch::Sender<bool>) {
    let live = match previous {
        ControlState::Enabling { attempt, .. } => {
            attempt.abort();
            let _ = attempt.await;
            true
        }
        ControlState::Enabled => true,
        _ => false,
    };
    if live {
        inner.transport.tear_down().await;
    }

    {
        let mut state = inner.state.lock();
        *state = ControlState::Disabled;
        inner.anonymizing.store(false, Ordering::SeqCst);
        inner.version.fetch_add(1, Ordering::SeqCst);
    }
    drained.send_replace(true);

    tracing::info!("bootstrap disabled");
    inner
        .bus
        .publish(&SessionEvent::Bootstrap(BootstrapPhase::Disabled));
}

async fn run_attempt(inner: Arc<Inner>, generation: u64, done: watch::Sender<Outcome>) {
    let policy = inner.policy.lock().clone();
    let superseded = || inner.generation.load(Ordering::SeqCst) != generation;

    let mut result = Err(BootstrapError::Timeout);
    for attempt in 0..=policy.retries {
        if attempt > 0 {
            tokio::time::sleep(policy.backoff.delay(attempt - 1)).await;
        }
        if superseded() {
            break;
        }
        inner.tries.fetch_add(1, Ordering::SeqCst);
        let bring_up = inner
            .transport
            .bring_up(policy.anonymize, inner.events.clone());
        result = match tokio::time::timeout(policy.timeout, bring_up).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BootstrapError::TransportUnavailable(e.to_string())),
            Err(_) => Err(BootstrapError::Timeout),
        };
        match &result {
            Ok(()) => break,
            Err(e) => tracing::warn!(
                attempt = attempt + 1,
                of = policy.retries + 1,
                error = %e,
                "bootstrap attempt failed"
            ),
        }
    }

    let committed = {
        let mut state = inner.state.lock();
        let current = matches!(
            &*state,
            ControlState::Enabling { generation: g, .. } if *g == generation
        );
        if current {
            *state = match &result {
                Ok(()) => ControlState::Enabled,
                Err(e) => ControlState::Failed(e.clone()),
            };
            inner
                .anonymizing
                .store(result.is_ok() && policy.anonymize, Ordering::SeqCst);
            inner.enabled.store(result.is_ok(), Ordering::SeqCst);
            inner.version.fetch_add(1, Ordering::SeqCst);
        }
        current
    };

    // The disable that superseded this attempt owns the teardown.
    if !committed {
        tracing::debug!("bootstrap attempt superseded by disable");
        done.send_replace(Some(Err(BootstrapError::TransportUnavailable(
            "bootstrap disabled while enabling".into(),
        ))));
        return;
    }

    let phase = match &result {
        Ok(()) => {
            tracing::info!(anonymize = policy.anonymize, "bootstrap enabled");
            BootstrapPhase::Enabled
        }
        Err(e) => {
            tracing::warn!(error = %e, "bootstrap failed, transport disabled");
            BootstrapPhase::Failed(e.clone())
        }
    };
    done.send_replace(Some(result));
    inner.bus.publish(&SessionEvent::Bootstrap(phase));
}
