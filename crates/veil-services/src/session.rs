//! Session context: owns every component of the network core and the
//! background tasks that connect them. There are no process-wide globals;
//! hosts build one `Session` and pass it around.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use veil_core::config::VeilConfig;
use veil_core::PeerId;

use crate::bootstrap::{BootstrapController, BootstrapPolicy};
use crate::bus::{EventBus, SessionEvent, Subscription};
use crate::directory::DirectoryClient;
use crate::health::HealthAggregator;
use crate::registry::PeerRegistry;
use crate::settings::{KeyValueBackend, SettingsStore, TRANSPORT_ANONYMIZE};
use crate::store::ContentStore;
use crate::transfer::{TransferEngine, TransferPolicy};
use crate::transport::{PeerEvent, Transport};

pub struct Session {
    pub bus: EventBus<SessionEvent>,
    pub registry: PeerRegistry,
    pub bootstrap: BootstrapController,
    pub transfers: TransferEngine,
    pub health: HealthAggregator,
    pub directory: DirectoryClient,
    pub settings: Arc<SettingsStore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    _settings_sub: Subscription,
}

impl Session {
    /// Wire up all components and spawn the background tasks.
    /// Must be called from inside a tokio runtime.
    pub fn start(
        config: &VeilConfig,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn KeyValueBackend>,
        store: ContentStore,
    ) -> Arc<Self> {
        let bus = EventBus::new();
        let settings = Arc::new(SettingsStore::load(backend, bus.clone()));
        let registry = PeerRegistry::new(bus.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut policy = BootstrapPolicy::from_config(&config.transport);
        if let Some(anonymize) = settings.get_parsed::<bool>(TRANSPORT_ANONYMIZE) {
            policy.anonymize = anonymize;
        }
        let bootstrap =
            BootstrapController::new(transport.clone(), events_tx, bus.clone(), policy);

        let transfers = TransferEngine::new(
            transport.clone(),
            bootstrap.clone(),
            registry.clone(),
            store,
            bus.clone(),
            TransferPolicy::from_config(&config.transfer),
        );
        let health = HealthAggregator::new(
            registry.clone(),
            bootstrap.clone(),
            transfers.clone(),
            &bus,
            &config.health,
        );
        let directory = DirectoryClient::new(
            transport,
            bootstrap.clone(),
            settings.clone(),
            &config.directory,
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (settings_rx, settings_sub) = bus.subscribe_channel();

        let tasks = vec![
            tokio::spawn(pump_peer_events(
                registry.clone(),
                events_rx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(registry.clone().sweep_loop(
                config.registry.sweep_interval(),
                config.registry.stale_after(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(apply_settings(bootstrap.clone(), settings_rx, shutdown_rx)),
        ];

        tracing::info!(
            anonymize = bootstrap.anonymize(),
            settings_degraded = settings.is_degraded(),
            "session started"
        );

        Arc::new(Self {
            bus,
            registry,
            bootstrap,
            transfers,
            health,
            directory,
            settings,
            shutdown,
            tasks: Mutex::new(tasks),
            _settings_sub: settings_sub,
        })
    }

    /// Disable the transport, cancel transfers, and stop background tasks.
    pub async fn stop(&self) {
        let cancelled = self.transfers.cancel_all();
        self.bootstrap.disable().await;
        self.shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(cancelled, "session stopped");
    }
}

/// Single writer into the registry, in arrival order.
async fn pump_peer_events(
    registry: PeerRegistry,
    mut events: mpsc::UnboundedReceiver<(PeerId, PeerEvent)>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = events.recv() => {
                let Some((peer, event)) = next else { break };
                if let Err(e) = registry.upsert(peer, event) {
                    tracing::debug!(error = %e, "peer event rejected");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("peer event pump stopped");
}

/// Settings that drive live components.
async fn apply_settings(
    bootstrap: BootstrapController,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = events.recv() => {
                let Some(event) = next else { break };
                if let SessionEvent::SettingChanged { key, value } = event {
                    if key == TRANSPORT_ANONYMIZE {
                        match value.parse::<bool>() {
                            Ok(anonymize) => bootstrap.set_anonymize(anonymize),
                            Err(_) => tracing::warn!(%value, "ignoring invalid {TRANSPORT_ANONYMIZE}"),
                        }
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
