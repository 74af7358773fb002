use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::session::{session_id_from_headers, Session, SessionRegistry, ToolServerFetcher};
use crate::transport::HttpTransport;
use crate::turn::TurnOrchestrator;

/// Shared application state accessible to all handlers.
pub struct AppState {
    pub config: AppConfig,
    pub transport: Arc<HttpTransport>,
    pub sessions: SessionRegistry,
    pub orchestrator: TurnOrchestrator,
    fetcher: Arc<ToolServerFetcher>,
    shutdown: CancellationToken,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, transport: HttpTransport) -> Self {
        let transport = Arc::new(transport);
        let fetcher = Arc::new(ToolServerFetcher::from_config(transport.clone(), &config));
        let auto_fetcher = config
            .features
            .auto_discover_tools
            .then(|| fetcher.clone());
        let orchestrator = TurnOrchestrator::new(&config, transport.clone(), auto_fetcher);
        let sessions = SessionRegistry::with_max_entries(config.features.max_sessions);

        Self {
            config,
            transport,
            sessions,
            orchestrator,
            fetcher,
            shutdown: CancellationToken::new(),
        }
    }

    /// Session addressed by the request's `x-session-id` header.
    #[must_use]
    pub fn session_for(&self, headers: &http::HeaderMap) -> Arc<Session> {
        self.sessions.get_or_create(session_id_from_headers(headers))
    }

    #[must_use]
    pub fn tool_fetcher(&self) -> Arc<ToolServerFetcher> {
        self.fetcher.clone()
    }

    /// Token for one turn; fires when the server shuts down.
    #[must_use]
    pub fn turn_cancellation(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Cancel every in-flight turn.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for cancelled turns to run their cleanup, up to `grace`.
    /// Returns the number still in flight when the wait ended.
    pub async fn drain_turns(&self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.sessions.turns_in_flight();
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                return remaining;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);
