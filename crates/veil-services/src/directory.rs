//! Community directory client.
//!
//! `discover` exposes the transport's paginated query as one lazy stream.
//! Nothing is requested until the stream is polled, and each page is
//! fetched only once the previous one has been consumed. Calling `discover`
//! again starts a fresh query from the first page.
//!
//! Memberships are keyed by (identity, community) and persisted through the
//! settings store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use veil_core::config::DirectoryConfig;
use veil_core::{
    CommunityDiscoveryResult, CommunityEngagementSettings, CommunityId, DirectoryError,
    DiscoveryPage, DiscoveryQuery, JoinRequest,
};

use crate::bootstrap::BootstrapController;
use crate::settings::{SettingsStore, COMMUNITY_MEMBERSHIPS};
use crate::transport::Transport;

type MembershipKey = (String, CommunityId);

struct Inner {
    transport: Arc<dyn Transport>,
    bootstrap: BootstrapController,
    settings: Arc<SettingsStore>,
    page_size: usize,
    memberships: DashMap<MembershipKey, CommunityEngagementSettings>,
    join_locks: DashMap<MembershipKey, Arc<tokio::sync::Mutex<()>>>,
}

#[derive(Clone)]
pub struct DirectoryClient {
    inner: Arc<Inner>,
}

struct PageCursor {
    query: DiscoveryQuery,
    next: Option<String>,
    buffered: VecDeque<CommunityDiscoveryResult>,
    exhausted: bool,
}

impl DirectoryClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        bootstrap: BootstrapController,
        settings: Arc<SettingsStore>,
        config: &DirectoryConfig,
    ) -> Self {
        let memberships = DashMap::new();
        let saved: Vec<CommunityEngagementSettings> =
            settings.get_json(COMMUNITY_MEMBERSHIPS).unwrap_or_default();
        for m in saved {
            memberships.insert((m.identity.clone(), m.community_id.clone()), m);
        }
        tracing::debug!(count = memberships.len(), "community memberships loaded");

        Self {
            inner: Arc::new(Inner {
                transport,
                bootstrap,
                settings,
                page_size: config.page_size.max(1),
                memberships,
                join_locks: DashMap::new(),
            }),
        }
    }

    /// Lazy, finite sequence of matching communities. Fails fast when the
    /// transport is down; a `deadline` bounds each page request.
    pub fn discover(
        &self,
        query: DiscoveryQuery,
        deadline: Option<Duration>,
    ) -> Result<BoxStream<'static, Result<CommunityDiscoveryResult, DirectoryError>>, DirectoryError>
    {
        self.require_transport()?;

        let inner = self.inner.clone();
        let start = PageCursor {
            query,
            next: None,
            buffered: VecDeque::new(),
            exhausted: false,
        };
        let results = stream::unfold(Some(start), move |cursor| {
            let inner = inner.clone();
            async move {
                let mut cursor = cursor?;
                loop {
                    if let Some(item) = cursor.buffered.pop_front() {
                        return Some((Ok(item), Some(cursor)));
                    }
                    if cursor.exhausted {
                        return None;
                    }
                    match inner.fetch_page(&cursor.query, cursor.next.take(), deadline).await {
                        Ok(page) => {
                            cursor.exhausted = page.next_cursor.is_none();
                            cursor.next = page.next_cursor;
                            cursor.buffered.extend(page.results);
                        }
                        Err(e) => return Some((Err(e), None)),
                    }
                }
            }
        });
        Ok(results.boxed())
    }

    /// Drain `discover` into a vector.
    pub async fn discover_all(
        &self,
        query: DiscoveryQuery,
        deadline: Option<Duration>,
    ) -> Result<Vec<CommunityDiscoveryResult>, DirectoryError> {
        self.discover(query, deadline)?.try_collect().await
    }

    /// Join a community. Joining again as the same identity returns the
    /// existing membership without contacting the network.
    pub async fn join(
        &self,
        request: JoinRequest,
    ) -> Result<CommunityEngagementSettings, DirectoryError> {
        self.join_with_deadline(request, None).await
    }

    /// Like `join`, bounded by `deadline`. A join that misses its deadline
    /// records no membership.
    pub async fn join_with_deadline(
        &self,
        request: JoinRequest,
        deadline: Option<Duration>,
    ) -> Result<CommunityEngagementSettings, DirectoryError> {
        self.require_transport()?;
        if let Some(existing) = self.engagement(&request.identity, &request.community_id) {
            return Ok(existing);
        }

        let joining = self.join_once(request);
        match deadline {
            None => joining.await,
            Some(d) => tokio::time::timeout(d, joining).await.unwrap_or_else(|_| {
                tracing::warn!(deadline_ms = d.as_millis() as u64, "community join timed out");
                Err(DirectoryError::TimedOut)
            }),
        }
    }

    async fn join_once(
        &self,
        request: JoinRequest,
    ) -> Result<CommunityEngagementSettings, DirectoryError> {
        let key = (request.identity.clone(), request.community_id.clone());
        let lock = self
            .inner
            .join_locks
            .entry(key.clone())
            .or_default()
            .clone();
        let _guard = lock.lock().await;
        if let Some(existing) = self.engagement(&request.identity, &request.community_id) {
            return Ok(existing);
        }

        let settings = self
            .inner
            .transport
            .join_community(&request)
            .await
            .map_err(|e| DirectoryError::QueryFailed(e.to_string()))?;
        tracing::info!(
            community = %request.community_id,
            identity = %request.identity,
            "joined community"
        );
        self.inner.memberships.insert(key, settings.clone());
        self.persist();
        Ok(settings)
    }

    pub fn engagement(&self, identity: &str, community: &CommunityId) -> Option<CommunityEngagementSettings> {
        self.inner
            .memberships
            .get(&(identity.to_string(), community.clone()))
            .map(|m| m.value().clone())
    }

    /// All memberships, ordered by community then identity.
    pub fn memberships(&self) -> Vec<CommunityEngagementSettings> {
        let mut all: Vec<_> = self
            .inner
            .memberships
            .iter()
            .map(|m| m.value().clone())
            .collect();
        all.sort_by(|a, b| {
            a.community_id
                .cmp(&b.community_id)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        all
    }

    pub fn leave(&self, identity: &str, community: &CommunityId) -> bool {
        let removed = self
            .inner
            .memberships
            .remove(&(identity.to_string(), community.clone()))
            .is_some();
        if removed {
            tracing::info!(community = %community, identity, "left community");
            self.persist();
        }
        removed
    }

    fn require_transport(&self) -> Result<(), DirectoryError> {
        if self.inner.bootstrap.is_enabled() {
            Ok(())
        } else {
            Err(DirectoryError::TransportUnavailable)
        }
    }

    /// Failures are already reported by the settings store.
    fn persist(&self) {
        let _ = self
            .inner
            .settings
            .set_json(COMMUNITY_MEMBERSHIPS, &self.memberships());
    }
}

impl Inner {
    async fn fetch_page(
        &self,
        query: &DiscoveryQuery,
        cursor: Option<String>,
        deadline: Option<Duration>,
    ) -> Result<DiscoveryPage, DirectoryError> {
        if !self.bootstrap.is_enabled() {
            return Err(DirectoryError::TransportUnavailable);
        }
        let request = self
            .transport
            .query_communities(query, cursor, self.page_size);
        let page = match deadline {
            None => request.await,
            Some(d) => tokio::time::timeout(d, request)
                .await
                .map_err(|_| DirectoryError::TimedOut)?,
        };
        page.map_err(|e| DirectoryError::QueryFailed(e.to_string()))
    }
}
