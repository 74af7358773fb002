use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http::HeaderMap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::Session;

pub const SESSION_HEADER: &str = "x-session-id";
pub const DEFAULT_SESSION_ID: &str = "default";
const SESSION_ID_MAX_LEN: usize = 128;

/// Session id carried by a request, falling back to [`DEFAULT_SESSION_ID`]
/// when the header is missing, blank, non-ASCII or oversized.
#[must_use]
pub fn session_id_from_headers(headers: &HeaderMap) -> &str {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= SESSION_ID_MAX_LEN)
        .unwrap_or(DEFAULT_SESSION_ID)
}

/// Default bound on live sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 4096;

/// Process-wide table of live sessions, bounded by `max_entries`.
///
/// When full, inserting evicts the least recently used idle session, falling
/// back to the least recently used one without a turn in flight.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<FxHashMap<Arc<str>, Arc<Session>>>,
    max_entries: usize,
    clock: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_max_entries(DEFAULT_MAX_SESSIONS)
    }
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            sessions: RwLock::new(FxHashMap::default()),
            max_entries: max_entries.max(1),
            clock: AtomicU64::new(1),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Handle for `id`, created on first use.
    #[must_use]
    pub fn get_or_create(&self, id: &str) -> Arc<Session> {
        let tick = self.tick();
        if let Some(existing) = self.sessions.read().get(id) {
            existing.touch(tick);
            return existing.clone();
        }

        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(id) {
            existing.touch(tick);
            return existing.clone();
        }
        if sessions.len() >= self.max_entries {
            evict_one(&mut sessions);
        }
        let key: Arc<str> = Arc::from(id);
        let session = Arc::new(Session::new(key.clone()));
        session.touch(tick);
        sessions.insert(key, session.clone());
        tracing::debug!(session = id, "session created");
        session
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Sessions currently holding a turn permit.
    #[must_use]
    pub fn turns_in_flight(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|session| session.is_turn_in_flight())
            .count()
    }
}

fn evict_one(sessions: &mut FxHashMap<Arc<str>, Arc<Session>>) {
    let oldest = |only_idle: bool| {
        sessions
            .iter()
            .filter(|(_, session)| {
                if only_idle {
                    session.is_idle()
                } else {
                    !session.is_turn_in_flight()
                }
            })
            .min_by_key(|(_, session)| session.last_used())
            .map(|(key, _)| key.clone())
    };
    let Some(victim) = oldest(true).or_else(|| oldest(false)) else {
        tracing::warn!(sessions = sessions.len(), "session registry full of active turns");
        return;
    };
    if let Some(evicted) = sessions.remove(&victim) {
        if evicted.has_pending_files() {
            tracing::warn!(session = %victim, "evicted session with pending files");
        } else {
            tracing::debug!(session = %victim, "evicted idle session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_get_or_create_returns_same_handle() {
        let registry = SessionRegistry::new();
        assert!(registry.get("a").is_none());
        let first = registry.get_or_create("a");
        let second = registry.get_or_create("a");
        assert!(Arc::ptr_eq(&first, &second));
        first.add_file_ids(["f1"]);
        assert_eq!(registry.get("a").unwrap().file_ids(), vec!["f1"]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_session_id_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_id_from_headers(&headers), DEFAULT_SESSION_ID);

        headers.insert(SESSION_HEADER, HeaderValue::from_static("  thread-42 "));
        assert_eq!(session_id_from_headers(&headers), "thread-42");

        headers.insert(SESSION_HEADER, HeaderValue::from_static("   "));
        assert_eq!(session_id_from_headers(&headers), DEFAULT_SESSION_ID);

        let long = "x".repeat(SESSION_ID_MAX_LEN + 1);
        headers.insert(SESSION_HEADER, HeaderValue::from_str(&long).unwrap());
        assert_eq!(session_id_from_headers(&headers), DEFAULT_SESSION_ID);
    }

    #[test]
    fn test_registry_is_bounded_and_evicts_least_recently_used() {
        let registry = SessionRegistry::with_max_entries(3);
        for idx in 0..3 {
            let _ = registry.get_or_create(&format!("s{idx}"));
        }
        // s0 is refreshed, so s1 is the oldest idle entry.
        let _ = registry.get_or_create("s0");
        let _ = registry.get_or_create("s3");
        assert_eq!(registry.len(), 3);
        assert!(registry.get("s1").is_none());
        assert!(registry.get("s0").is_some());

        for idx in 4..100 {
            let _ = registry.get_or_create(&format!("s{idx}"));
        }
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_eviction_prefers_idle_and_spares_turns_in_flight() {
        let registry = SessionRegistry::with_max_entries(2);
        let busy = registry.get_or_create("busy");
        let _permit = busy.begin_turn().unwrap();
        registry.get_or_create("files").add_file_ids(["f1"]);

        // Nothing is idle: the oldest session without a turn goes.
        let _ = registry.get_or_create("fresh");
        assert!(registry.get("busy").is_some());
        assert!(registry.get("files").is_none());
        assert_eq!(registry.turns_in_flight(), 1);

        // "fresh" is idle and goes before the busy one.
        let _ = registry.get_or_create("next");
        assert!(registry.get("busy").is_some());
        assert!(registry.get("fresh").is_none());
        assert_eq!(registry.len(), 2);
    }
}
