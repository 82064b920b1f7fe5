//! Network health aggregator.
//!
//! `snapshot()` and `metrics()` are derived from the registry, the bootstrap
//! controller, and transfer history. The only state kept here is a short-lived
//! cache of the last computation and the last status seen by subscribers.
//! Subscribers hear about status changes only, not every peer event.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;

use veil_core::config::HealthConfig;
use veil_core::{
    ConnectionState, HealthStatus, NetworkHealth, NetworkMetrics, TransferDirection,
    TransferState,
};

use crate::bootstrap::{BootstrapController, BootstrapPhase};
use crate::bus::{EventBus, SessionEvent, Subscription};
use crate::registry::PeerRegistry;
use crate::transfer::TransferEngine;

struct CachedHealth {
    at: Instant,
    versions: (u64, u64),
    health: NetworkHealth,
}

struct Inner {
    registry: PeerRegistry,
    bootstrap: BootstrapController,
    transfers: TransferEngine,
    debounce: Duration,
    window: Duration,
    health_cache: Mutex<Option<CachedHealth>>,
    metrics_cache: Mutex<Option<(Instant, NetworkMetrics)>>,
    last_status: Mutex<HealthStatus>,
    listeners: EventBus<NetworkHealth>,
    session_sub: Mutex<Option<Subscription>>,
}

#[derive(Clone)]
pub struct HealthAggregator {
    inner: Arc<Inner>,
}

impl HealthAggregator {
    pub fn new(
        registry: PeerRegistry,
        bootstrap: BootstrapController,
        transfers: TransferEngine,
        bus: &EventBus<SessionEvent>,
        config: &HealthConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            registry,
            bootstrap,
            transfers,
            debounce: config.debounce(),
            window: config.metrics_window(),
            health_cache: Mutex::new(None),
            metrics_cache: Mutex::new(None),
            last_status: Mutex::new(HealthStatus::Unknown),
            listeners: EventBus::new(),
            session_sub: Mutex::new(None),
        });
        *inner.last_status.lock() = inner.compute().status;

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        let sub = bus.subscribe(move |event: &SessionEvent| {
            let relevant = matches!(
                event,
                SessionEvent::PeerChanged { .. }
                    | SessionEvent::PeerRemoved(_)
                    | SessionEvent::Bootstrap(_)
            );
            if let (true, Some(inner)) = (relevant, weak.upgrade()) {
                inner.check_status();
            }
        });
        *inner.session_sub.lock() = Some(sub);

        Self { inner }
    }

    /// Current health, cached while nothing relevant changed.
    pub fn snapshot(&self) -> NetworkHealth {
        let versions = self.inner.versions();
        {
            let cache = self.inner.health_cache.lock();
            if let Some(c) = cache.as_ref() {
                if c.versions == versions && c.at.elapsed() < self.inner.debounce {
                    return c.health.clone();
                }
            }
        }
        self.inner.compute()
    }

    /// Throughput, latency and success rate over the metrics window.
    pub fn metrics(&self) -> NetworkMetrics {
        {
            let cache = self.inner.metrics_cache.lock();
            if let Some((at, m)) = cache.as_ref() {
                if at.elapsed() < self.inner.debounce {
                    return m.clone();
                }
            }
        }
        let metrics = self.inner.compute_metrics(SystemTime::now());
        *self.inner.metrics_cache.lock() = Some((Instant::now(), metrics.clone()));
        metrics
    }

    /// Called with the new snapshot whenever the derived status changes.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&NetworkHealth) + Send + Sync + 'static,
    {
        self.inner.listeners.subscribe(callback)
    }
}

impl Inner {
    fn versions(&self) -> (u64, u64) {
        (self.registry.version(), self.bootstrap.version())
    }

    fn compute(&self) -> NetworkHealth {
        let versions = self.versions();
        let connected = self.registry.count_in(ConnectionState::Connected);

        let (status, error_message) = match self.bootstrap.phase() {
            BootstrapPhase::Failed(e) => (HealthStatus::Error, Some(e.to_string())),
            _ if connected > 0 => (HealthStatus::Connected, None),
            _ if self.registry.count_in(ConnectionState::Connecting) > 0 => {
                (HealthStatus::Connecting, None)
            }
            _ => (HealthStatus::Disconnected, None),
        };

        let health = NetworkHealth {
            status,
            connected_peer_count: connected,
            anonymizing_transport_enabled: self.bootstrap.anonymizing(),
            last_connected_at: self.registry.last_connected_at(),
            error_message,
        };
        *self.health_cache.lock() = Some(CachedHealth {
            at: Instant::now(),
            versions,
            health: health.clone(),
        });
        health
    }

    fn check_status(&self) {
        let changed = {
            let mut last = self.last_status.lock();
            let health = self.compute();
            let previous = *last;
            if previous != health.status {
                tracing::info!(from = ?previous, to = ?health.status, "network health changed");
                *last = health.status;
                Some(health)
            } else {
                None
            }
        };
        if let Some(health) = changed {
            self.listeners.publish(&health);
        }
    }

    fn compute_metrics(&self, now: SystemTime) -> NetworkMetrics {
        let cutoff = now.checked_sub(self.window).unwrap_or(SystemTime::UNIX_EPOCH);
        let recent: Vec<_> = self
            .transfers
            .history()
            .into_iter()
            .filter(|op| op.finished_at.map_or(false, |t| t >= cutoff))
            .collect();

        let secs = self.window.as_secs_f64().max(0.001);
        let bytes_in = |direction: TransferDirection| -> u64 {
            recent
                .iter()
                .filter(|op| op.direction == direction)
                .map(|op| op.bytes_transferred)
                .sum()
        };

        let latencies: Vec<f64> = recent
            .iter()
            .filter_map(|op| op.latency())
            .map(|d| d.as_secs_f64() * 1000.0)
            .collect();
        let average_latency_ms = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };

        let completed = recent
            .iter()
            .filter(|op| op.state == TransferState::Completed)
            .count();
        let failed = recent
            .iter()
            .filter(|op| op.state == TransferState::Failed)
            .count();
        let success_rate = if completed + failed == 0 {
            1.0
        } else {
            completed as f64 / (completed + failed) as f64
        };

        NetworkMetrics {
            download_rate_bps: bytes_in(TransferDirection::Fetch) as f64 / secs,
            upload_rate_bps: bytes_in(TransferDirection::Publish) as f64 / secs,
            average_latency_ms,
            success_rate,
            total_connections: self.registry.len(),
            active_connections: self.registry.count_in(ConnectionState::Connected),
            bytes_sent: self.transfers.bytes_sent(),
            bytes_received: self.transfers.bytes_received(),
        }
    }
}
