use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{RwLock, broadcast};

use maxx_common::{AttemptStatus, CooldownReason, Dialect, RequestStatus};

/// Fire-and-forget notifications about request lifecycle.
#[derive(Debug, Clone, Serialize)]
pub enum Event {
    RequestCreated {
        request_id: String,
        dialect: Dialect,
        model: String,
        at: OffsetDateTime,
    },
    RequestStarted {
        request_id: String,
        at: OffsetDateTime,
    },
    RequestFinished {
        request_id: String,
        status: RequestStatus,
        at: OffsetDateTime,
    },
    AttemptStarted {
        request_id: String,
        attempt_id: String,
        route_id: i64,
        provider_id: i64,
        attempt_no: u32,
        at: OffsetDateTime,
    },
    AttemptFinished {
        request_id: String,
        attempt_id: String,
        status: AttemptStatus,
        error: Option<String>,
        at: OffsetDateTime,
    },
    CooldownStarted {
        provider_id: i64,
        dialect: Dialect,
        reason: CooldownReason,
        until: OffsetDateTime,
        at: OffsetDateTime,
    },
    CooldownCleared {
        provider_id: i64,
        dialect: Dialect,
        at: OffsetDateTime,
    },
}

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    pub async fn emit(&self, event: Event) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event_ref = event.clone();
            tokio::spawn(async move {
                sink.write(&event_ref).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let hub = EventHub::new(16);
        let mut rx = hub.subscribe();
        hub.emit(Event::RequestStarted {
            request_id: "req-1".to_string(),
            at: OffsetDateTime::now_utc(),
        })
        .await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::RequestStarted { request_id, .. } if request_id == "req-1"));
    }
}
