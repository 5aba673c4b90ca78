use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Signatures shorter than this are treated as absent.
pub const MIN_SIGNATURE_LEN: usize = 10;

pub fn is_valid_signature(signature: &str) -> bool {
    signature.len() >= MIN_SIGNATURE_LEN
}

/// Cache of thought signatures keyed by session, plus the process-wide
/// most recent one.
///
/// Gemini-3-Pro rejects function-call history without a `thoughtSignature`;
/// the translator back-fills the last valid signature seen for the session.
/// Constructed once at bootstrap and shared via `Arc`, never ambient state.
pub struct SignatureCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

#[derive(Default)]
struct Inner {
    latest: Option<String>,
    by_session: HashMap<String, String>,
    order: VecDeque<String>,
}

impl SignatureCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Record a signature for a session. Invalid signatures are ignored.
    pub fn record(&self, session_id: Option<&str>, signature: &str) {
        if !is_valid_signature(signature) {
            return;
        }
        let mut inner = self.inner.lock().expect("signature cache lock");
        inner.latest = Some(signature.to_string());
        let Some(session_id) = session_id else {
            return;
        };
        if inner
            .by_session
            .insert(session_id.to_string(), signature.to_string())
            .is_none()
        {
            inner.order.push_back(session_id.to_string());
            while inner.order.len() > self.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.by_session.remove(&evicted);
                }
            }
        }
    }

    /// Session entry first, then the process-wide most recent.
    pub fn lookup(&self, session_id: Option<&str>) -> Option<String> {
        let inner = self.inner.lock().expect("signature cache lock");
        session_id
            .and_then(|id| inner.by_session.get(id).cloned())
            .or_else(|| inner.latest.clone())
    }

    /// Drop a session's entry when the session itself expires.
    pub fn remove_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("signature cache lock");
        inner.by_session.remove(session_id);
        inner.order.retain(|id| id != session_id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("signature cache lock").by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_signatures_ignored() {
        let cache = SignatureCache::new(4);
        cache.record(Some("s1"), "short");
        assert!(cache.lookup(Some("s1")).is_none());
    }

    #[test]
    fn session_entry_wins_over_latest() {
        let cache = SignatureCache::new(4);
        cache.record(Some("s1"), "signature-one");
        cache.record(Some("s2"), "signature-two");
        assert_eq!(cache.lookup(Some("s1")).as_deref(), Some("signature-one"));
        assert_eq!(cache.lookup(None).as_deref(), Some("signature-two"));
    }

    #[test]
    fn capacity_evicts_oldest_session() {
        let cache = SignatureCache::new(2);
        cache.record(Some("a"), "signature-aaa");
        cache.record(Some("b"), "signature-bbb");
        cache.record(Some("c"), "signature-ccc");
        assert_eq!(cache.len(), 2);
        // Evicted sessions fall back to the process-wide latest.
        assert_eq!(cache.lookup(Some("a")).as_deref(), Some("signature-ccc"));
    }

    #[test]
    fn remove_session_falls_back_to_latest() {
        let cache = SignatureCache::new(4);
        cache.record(Some("s1"), "signature-one");
        cache.remove_session("s1");
        assert_eq!(cache.lookup(Some("s1")).as_deref(), Some("signature-one"));
        assert_eq!(cache.len(), 0);
    }
}
