//! veild: Veil overlay node daemon.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use veil_core::config::{data_dir, VeilConfig};
use veil_core::PeerId;
use veil_services::settings::STORAGE_FOLDER;
use veil_services::{ContentStore, FileBackend, KeyValueBackend, Session};

mod overlay;

use overlay::{OverlayConfig, OverlayTransport};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = VeilConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = VeilConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        VeilConfig::default()
    });

    let node_id = load_or_create_node_id(&config.identity.node_id_path)?;
    tracing::info!(node_id = %node_id, alias = %config.identity.alias, "veild starting");

    // Settings backend, read once here for the storage folder
    let backend = Arc::new(FileBackend::new(config.persistence.settings_path.clone()));
    let storage_root = match backend.read(STORAGE_FOLDER) {
        Ok(Some(folder)) if !folder.trim().is_empty() => folder.into(),
        Ok(_) => config.transfer.storage_path.clone(),
        Err(e) => {
            tracing::warn!(error = %e, "settings unreadable, using configured storage path");
            config.transfer.storage_path.clone()
        }
    };
    let store = ContentStore::new(&storage_root)?;
    tracing::info!(root = %storage_root.display(), objects = store.count(), "content store ready");

    // Overlay transport and session
    let (transport, mut uploads) =
        OverlayTransport::new(OverlayConfig::from_config(node_id, &config), store.clone());
    let session = Session::start(&config, Arc::new(transport), backend, store);

    {
        let session = session.clone();
        tokio::spawn(async move {
            while let Some(bytes) = uploads.recv().await {
                session.transfers.record_upload(bytes);
            }
        });
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // Local control API
    let api_port = config.network.api_port;
    let api_task = {
        let state = veil_api::ApiState {
            session: session.clone(),
            identity: config.identity.alias.clone(),
            upload_dir: data_dir().join("uploads"),
            shutdown_tx: shutdown_tx.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = veil_api::serve(state, api_port).await {
                tracing::error!(error = %e, "API server failed");
            }
        })
    };

    // Bring the overlay up; failure leaves the node reachable over the API
    // so the user can retry.
    {
        let session = session.clone();
        tokio::spawn(async move {
            if let Err(e) = session.bootstrap.enable().await {
                tracing::warn!(error = %e, "initial bootstrap failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = api_task           => tracing::error!("API task exited: {:?}", r),
    }

    session.stop().await;
    Ok(())
}

/// Read the persisted node id, or generate and persist a new one.
fn load_or_create_node_id(path: &Path) -> Result<PeerId> {
    match std::fs::read_to_string(path) {
        Ok(text) => text
            .trim()
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
            .with_context(|| format!("invalid node id in {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = PeerId::random();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(path, id.to_string())
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "generated node id");
            Ok(id)
        }
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_generated_once_and_reused() {
        let dir = std::env::temp_dir().join(format!("veild-node-id-{}", std::process::id()));
        let path = dir.join("nested").join("node_id");
        let first = load_or_create_node_id(&path).unwrap();
        let second = load_or_create_node_id(&path).unwrap();
        assert_eq!(first, second);

        std::fs::write(&path, "not hex").unwrap();
        assert!(load_or_create_node_id(&path).is_err());
        let _ = std::fs::remove_dir_all(dir);
    }
}
