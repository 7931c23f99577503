use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::fmt::{self, Display};

/// Service configuration blob handed to the consumer. Shape is owned by the
/// backend that minted it.
pub type ServiceConfiguration = serde_json::Value;

/// Releases per-session resources (peer entries, NAT rules, reserved IPs).
/// Must be invoked exactly once when the session ends.
pub type DestroyCallback = Box<dyn FnOnce() + Send>;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new_random() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One consumer's use of one instance.
pub struct Session {
    pub id: SessionId,
    pub consumer_id: String,
    pub configuration: ServiceConfiguration,
    destroy: Option<DestroyCallback>,
}

impl Session {
    pub fn new(
        consumer_id: String,
        configuration: ServiceConfiguration,
        destroy: Option<DestroyCallback>,
    ) -> Self {
        Session {
            id: SessionId::new_random(),
            consumer_id,
            configuration,
            destroy,
        }
    }

    /// Fires the destroy callback. Safe to call more than once; only the
    /// first call reaches the backend.
    pub fn destroy(&mut self) {
        if let Some(destroy) = self.destroy.take() {
            destroy();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn destroy_fires_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut session = Session::new(
            "consumer-1".to_string(),
            serde_json::json!({}),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        session.destroy();
        session.destroy();
        drop(session);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn random_ids_are_distinct() {
        assert_ne!(SessionId::new_random(), SessionId::new_random());
    }
}
