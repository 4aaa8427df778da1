//! Advisory widget locks and best-effort fan-out of session events.

use chrono::{Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::Stream;
use livecell_base::error::LiveError;
use livecell_base::protocol::CollaborationEvent;
use livecell_base::widget::{ClientId, SessionId, WidgetId, WidgetLock};
use tokio::sync::broadcast;

/// Per-session lock table and event channel.
#[derive(Debug)]
pub struct CollaborationHub {
    session_id: SessionId,
    locks: DashMap<WidgetId, WidgetLock>,
    /// none: locks never expire
    lock_ttl: Option<Duration>,
    sender: broadcast::Sender<CollaborationEvent>,
}

impl CollaborationHub {
    pub fn new(session_id: SessionId, lock_ttl_sec: u64, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            session_id,
            locks: DashMap::new(),
            lock_ttl: (lock_ttl_sec > 0).then(|| Duration::seconds(lock_ttl_sec.min(i64::MAX as u64) as i64)),
            sender,
        }
    }

    fn is_live(&self, lock: &WidgetLock) -> bool {
        match self.lock_ttl {
            Some(ttl) => Utc::now().signed_duration_since(lock.acquired_at) <= ttl,
            None => true,
        }
    }

    /// Acquire or refresh the lock. Never waits: `false` when another
    /// holder owns a live lock.
    pub fn request_lock(&self, widget_id: &WidgetId, holder_id: &ClientId) -> bool {
        let lock = WidgetLock {
            holder_id: holder_id.clone(),
            acquired_at: Utc::now(),
        };
        let acquired = match self.locks.entry(widget_id.clone()) {
            Entry::Occupied(mut e) => {
                if &e.get().holder_id == holder_id || !self.is_live(e.get()) {
                    e.insert(lock.clone());
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert(lock.clone());
                true
            }
        };
        tracing::debug!(
            session_id = %self.session_id,
            widget_id = %widget_id,
            holder_id = %holder_id,
            acquired,
            "lock requested"
        );
        if acquired {
            self.broadcast(CollaborationEvent::LockChanged {
                widget_id: widget_id.clone(),
                lock: Some(lock),
            });
        }
        acquired
    }

    /// No-op unless `holder_id` holds the lock. Returns whether it was released.
    pub fn release_lock(&self, widget_id: &WidgetId, holder_id: &ClientId) -> bool {
        let released = self
            .locks
            .remove_if(widget_id, |_, lock| &lock.holder_id == holder_id)
            .is_some();
        if released {
            tracing::debug!(
                session_id = %self.session_id,
                widget_id = %widget_id,
                holder_id = %holder_id,
                "lock released"
            );
            self.broadcast(CollaborationEvent::LockChanged {
                widget_id: widget_id.clone(),
                lock: None,
            });
        }
        released
    }

    /// Live lock on the widget; an expired lock is dropped on the way.
    pub fn current_lock(&self, widget_id: &WidgetId) -> Option<WidgetLock> {
        let lock = self.locks.get(widget_id).map(|l| l.value().clone())?;
        if self.is_live(&lock) {
            Some(lock)
        } else {
            self.locks
                .remove_if(widget_id, |_, l| l.acquired_at == lock.acquired_at);
            None
        }
    }

    /// Reject a write from anyone but the holder of a live lock.
    pub fn check_write(
        &self,
        widget_id: &WidgetId,
        writer: Option<&ClientId>,
    ) -> Result<(), LiveError> {
        match self.current_lock(widget_id) {
            Some(lock) if Some(&lock.holder_id) != writer => Err(LiveError::LockConflict {
                widget_id: widget_id.to_string(),
                holder_id: lock.holder_id.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Best-effort: returns the number of observers reached, 0 when nobody
    /// listens.
    pub fn broadcast(&self, event: CollaborationEvent) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self, observer: Option<ClientId>) -> Observer {
        Observer {
            observer,
            receiver: self.sender.subscribe(),
        }
    }

    /// Forget a removed widget and tell everyone.
    pub fn drop_widget(&self, widget_id: &WidgetId) {
        self.locks.remove(widget_id);
        self.broadcast(CollaborationEvent::WidgetRemoved {
            widget_id: widget_id.clone(),
        });
    }

    pub fn clear(&self) {
        self.locks.clear();
    }
}

/// One observer's view of the session events, without its own.
#[derive(Debug)]
pub struct Observer {
    observer: Option<ClientId>,
    receiver: broadcast::Receiver<CollaborationEvent>,
}

impl Observer {
    fn is_own(&self, event: &CollaborationEvent) -> bool {
        match (&self.observer, event) {
            (Some(me), CollaborationEvent::ValueCommitted { origin, .. }) => {
                origin.as_ref() == Some(me)
            }
            _ => false,
        }
    }

    /// Next event for this observer; `None` once the session is closed.
    /// A lagging observer skips what it missed and should re-fetch state.
    pub async fn recv(&mut self) -> Option<CollaborationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.is_own(&event) => continue,
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "observer lagged, events skipped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Events as a stream that ends when the session closes.
    pub fn into_stream(mut self) -> impl Stream<Item = CollaborationEvent> + Send + 'static {
        async_stream::stream! {
            while let Some(event) = self.recv().await {
                yield event;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use livecell_base::widget::WidgetValue;

    fn hub() -> CollaborationHub {
        CollaborationHub::new(SessionId::new("s1"), 300, 16)
    }

    #[test]
    fn test_lock_exclusive_and_reentrant() {
        let hub = hub();
        let w = WidgetId::new("w1");
        let (a, b) = (ClientId::new("a"), ClientId::new("b"));
        assert!(hub.request_lock(&w, &a));
        assert!(hub.request_lock(&w, &a));
        assert!(!hub.request_lock(&w, &b));
        assert!(hub.check_write(&w, Some(&a)).is_ok());
        assert!(matches!(
            hub.check_write(&w, Some(&b)),
            Err(LiveError::LockConflict { .. })
        ));
        assert!(hub.check_write(&w, None).is_err());

        // release by a non-holder is a no-op
        assert!(!hub.release_lock(&w, &b));
        assert_eq!(hub.current_lock(&w).unwrap().holder_id, a);
        assert!(hub.release_lock(&w, &a));
        assert!(hub.current_lock(&w).is_none());
        assert!(hub.request_lock(&w, &b));
    }

    #[test]
    fn test_expired_lock_is_released() {
        let hub = hub();
        let w = WidgetId::new("w1");
        hub.locks.insert(
            w.clone(),
            WidgetLock {
                holder_id: ClientId::new("a"),
                acquired_at: Utc::now() - Duration::seconds(301),
            },
        );
        assert!(hub.current_lock(&w).is_none());
        assert!(hub.check_write(&w, Some(&ClientId::new("b"))).is_ok());
        assert!(hub.request_lock(&w, &ClientId::new("b")));
    }

    #[test]
    fn test_locks_without_ttl_never_expire() {
        let hub = CollaborationHub::new(SessionId::new("s1"), 0, 16);
        let w = WidgetId::new("w1");
        hub.locks.insert(
            w.clone(),
            WidgetLock {
                holder_id: ClientId::new("a"),
                acquired_at: Utc::now() - Duration::days(30),
            },
        );
        assert!(hub.current_lock(&w).is_some());
    }

    #[tokio::test]
    async fn test_observers_skip_their_own_commits() {
        let hub = hub();
        let (a, b) = (ClientId::new("a"), ClientId::new("b"));
        let mut obs_a = hub.subscribe(Some(a.clone()));
        let mut obs_b = hub.subscribe(Some(b.clone()));
        let event = CollaborationEvent::ValueCommitted {
            widget_id: WidgetId::new("w1"),
            value: WidgetValue::Number(5.0),
            version: 1,
            origin: Some(a.clone()),
            updated_at: Utc::now(),
        };
        assert_eq!(hub.broadcast(event.clone()), 2);
        hub.drop_widget(&WidgetId::new("w1"));

        assert_eq!(obs_b.recv().await, Some(event));
        // a never sees its own commit, only the removal
        assert!(matches!(
            obs_a.recv().await,
            Some(CollaborationEvent::WidgetRemoved { .. })
        ));
    }

    #[tokio::test]
    async fn test_lagging_observer_keeps_going() {
        let hub = CollaborationHub::new(SessionId::new("s1"), 0, 2);
        let mut obs = hub.subscribe(None);
        for i in 0..5 {
            hub.request_lock(&WidgetId::new(format!("w{}", i)), &ClientId::new("a"));
        }
        let first = obs.recv().await.unwrap();
        assert_eq!(first.widget_id(), &WidgetId::new("w3"));
        drop(hub);
        assert_eq!(obs.recv().await.unwrap().widget_id(), &WidgetId::new("w4"));
        assert!(obs.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_observer_stream_ends_with_session() {
        use futures::StreamExt;
        let hub = hub();
        let stream = hub.subscribe(None).into_stream();
        hub.drop_widget(&WidgetId::new("w1"));
        drop(hub);
        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name(), "widgetRemoved");
    }

    #[test]
    fn test_broadcast_without_observers() {
        assert_eq!(hub().broadcast(CollaborationEvent::WidgetRemoved {
            widget_id: WidgetId::new("w1")
        }), 0);
    }
}
