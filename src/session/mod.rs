//! Conversation-scoped state that outlives a single turn.
//!
//! A [`Session`] is always handled through an `Arc`: the upload path, the
//! tool endpoints and the turn orchestrator all receive the same handle from
//! the [`SessionRegistry`], so there is no process-wide attachment state.

pub mod discovery;
pub mod registry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::watch;

use crate::error::BridgeError;
use crate::protocol::canonical::ToolServerDescriptor;

pub use discovery::{parse_tool_servers, ToolServerFetcher};
pub use registry::{
    session_id_from_headers, SessionRegistry, DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_ID, SESSION_HEADER,
};

/// Cached tool-server descriptors.
#[derive(Debug, Clone, Default)]
pub enum ToolCache {
    /// Never fetched, or invalidated by a refresh.
    #[default]
    Unknown,
    Ready(Arc<[ToolServerDescriptor]>),
}

// Insertion-ordered set of file ids awaiting the next completed turn.
#[derive(Debug, Default)]
struct PendingFiles {
    order: Vec<String>,
    seen: FxHashSet<String>,
}

impl PendingFiles {
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_owned());
        self.order.push(id.to_owned());
        true
    }

    fn remove(&mut self, id: &str) -> bool {
        if !self.seen.remove(id) {
            return false;
        }
        self.order.retain(|existing| existing != id);
        true
    }

    fn remove_all(&mut self, ids: &[String]) -> usize {
        let before = self.order.len();
        for id in ids {
            self.seen.remove(id.as_str());
        }
        let seen = &self.seen;
        self.order.retain(|existing| seen.contains(existing.as_str()));
        before - self.order.len()
    }
}

pub struct Session {
    id: Arc<str>,
    files: Mutex<PendingFiles>,
    tools: watch::Sender<ToolCache>,
    discovery_in_flight: AtomicBool,
    turn_in_flight: AtomicBool,
    last_used: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pending_files", &self.files.lock().order.len())
            .field("turn_in_flight", &self.is_turn_in_flight())
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        let (tools, _) = watch::channel(ToolCache::Unknown);
        Self {
            id: id.into(),
            files: Mutex::new(PendingFiles::default()),
            tools,
            discovery_in_flight: AtomicBool::new(false),
            turn_in_flight: AtomicBool::new(false),
            last_used: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn touch(&self, tick: u64) {
        self.last_used.fetch_max(tick, Ordering::Relaxed);
    }

    pub(crate) fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Relaxed)
    }

    /// Nothing would be lost by forgetting this session.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.is_turn_in_flight() && !self.is_discovering_tools() && !self.has_pending_files()
    }

    /// Union `ids` into the pending set. Blank ids are skipped; adding an id
    /// twice is a no-op. Returns how many ids were new.
    pub fn add_file_ids<I, S>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut files = self.files.lock();
        ids.into_iter()
            .filter(|id| {
                let id = id.as_ref().trim();
                !id.is_empty() && files.insert(id)
            })
            .count()
    }

    /// Ordered snapshot of the pending file ids.
    #[must_use]
    pub fn file_ids(&self) -> Vec<String> {
        self.files.lock().order.clone()
    }

    /// Drop the ids a completed turn sent upstream. Ids added after that
    /// snapshot stay pending. Returns how many were removed.
    pub fn remove_file_ids(&self, ids: &[String]) -> usize {
        if ids.is_empty() {
            return 0;
        }
        self.files.lock().remove_all(ids)
    }

    #[must_use]
    pub fn has_pending_files(&self) -> bool {
        !self.files.lock().order.is_empty()
    }

    pub fn remove_file_id(&self, id: &str) -> bool {
        self.files.lock().remove(id)
    }

    /// Descriptors currently cached, if discovery has completed.
    #[must_use]
    pub fn cached_tool_servers(&self) -> Option<Arc<[ToolServerDescriptor]>> {
        match &*self.tools.borrow() {
            ToolCache::Ready(servers) => Some(servers.clone()),
            ToolCache::Unknown => None,
        }
    }

    pub fn set_tool_servers(&self, servers: Vec<ToolServerDescriptor>) {
        self.tools.send_replace(ToolCache::Ready(servers.into()));
    }

    pub fn invalidate_tool_servers(&self) {
        self.tools.send_replace(ToolCache::Unknown);
    }

    #[must_use]
    pub fn is_discovering_tools(&self) -> bool {
        self.discovery_in_flight.load(Ordering::Acquire)
    }

    /// Spawn a background discovery unless one is already running. Returns
    /// whether a new fetch was started.
    pub fn start_tool_discovery(self: &Arc<Self>, fetcher: Arc<ToolServerFetcher>) -> bool {
        if self
            .discovery_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let servers = fetcher.fetch_tool_servers().await;
            tracing::debug!(
                session = session.id(),
                servers = servers.len(),
                "tool discovery finished"
            );
            session.discovery_in_flight.store(false, Ordering::Release);
            session.set_tool_servers(servers);
        });
        true
    }

    /// Wait at most `wait` for descriptors to become available. Returns an
    /// empty list on timeout so a turn never blocks on discovery.
    pub async fn wait_for_tool_servers(&self, wait: Duration) -> Arc<[ToolServerDescriptor]> {
        let mut rx = self.tools.subscribe();
        let ready = async move {
            loop {
                let current = match &*rx.borrow_and_update() {
                    ToolCache::Ready(servers) => Some(servers.clone()),
                    ToolCache::Unknown => None,
                };
                if current.is_some() {
                    return current;
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        match tokio::time::timeout(wait, ready).await {
            Ok(Some(servers)) => servers,
            Ok(None) | Err(_) => {
                tracing::debug!(
                    session = self.id(),
                    wait_ms = wait.as_millis(),
                    "proceeding without tool servers"
                );
                Arc::from([])
            }
        }
    }

    /// Descriptors for the next turn: the cache when ready, otherwise a
    /// bounded wait on discovery (started here if needed).
    pub async fn tool_servers_for_turn(
        self: &Arc<Self>,
        fetcher: Option<&Arc<ToolServerFetcher>>,
        wait: Duration,
    ) -> Arc<[ToolServerDescriptor]> {
        if let Some(servers) = self.cached_tool_servers() {
            return servers;
        }
        let Some(fetcher) = fetcher else {
            return Arc::from([]);
        };
        self.start_tool_discovery(Arc::clone(fetcher));
        self.wait_for_tool_servers(wait).await
    }

    /// Invalidate the cache and refetch, waiting at most `wait`.
    pub async fn refresh_tool_servers(
        self: &Arc<Self>,
        fetcher: Arc<ToolServerFetcher>,
        wait: Duration,
    ) -> Arc<[ToolServerDescriptor]> {
        self.invalidate_tool_servers();
        self.start_tool_discovery(fetcher);
        self.wait_for_tool_servers(wait).await
    }

    /// Claim the session for one turn.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::TurnInFlight`] while another turn holds the permit.
    pub fn begin_turn(self: &Arc<Self>) -> Result<TurnPermit, BridgeError> {
        self.turn_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BridgeError::TurnInFlight(self.id.to_string()))?;
        Ok(TurnPermit {
            session: Arc::clone(self),
        })
    }

    #[must_use]
    pub fn is_turn_in_flight(&self) -> bool {
        self.turn_in_flight.load(Ordering::Acquire)
    }
}

/// Exclusive right to run a turn on a session; released on drop.
#[derive(Debug)]
pub struct TurnPermit {
    session: Arc<Session>,
}

impl TurnPermit {
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for TurnPermit {
    fn drop(&mut self) {
        self.session.turn_in_flight.store(false, Ordering::Release);
    }
}
