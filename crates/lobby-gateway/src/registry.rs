use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use lobby_types::events::ServerEvent;
use lobby_types::models::{RoomId, UserIdentity};

pub type SessionId = Uuid;

pub type EventReceiver = mpsc::Receiver<Arc<ServerEvent>>;

/// A live connection's outbound side, as seen by the registry.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub user: UserIdentity,
    tx: mpsc::Sender<Arc<ServerEvent>>,
}

struct Subscriber {
    handle: SessionHandle,
    dropped: u64,
}

/// Subscribers of one room. The mutex serializes broadcasts into the room,
/// so every subscriber sees the room's events in broadcast order.
#[derive(Default)]
struct RoomEntry {
    subscribers: Mutex<HashMap<SessionId, Subscriber>>,
}

impl RoomEntry {
    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide map from room to the live sessions subscribed to it.
///
/// `join`/`leave` take the map's write lock; `broadcast` only needs the read
/// lock plus the room's own mutex, so rooms fan out independently.
#[derive(Clone)]
pub struct SessionRegistry {
    rooms: Arc<RwLock<HashMap<RoomId, RoomEntry>>>,
    queue_capacity: usize,
}

impl SessionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Create the outbound queue for a new connection.
    pub fn open_session(&self, user: UserIdentity) -> (SessionHandle, EventReceiver) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let handle = SessionHandle {
            id: Uuid::new_v4(),
            user,
            tx,
        };
        (handle, rx)
    }

    /// Add `session` to the room's subscribers. Returns false if it was
    /// already subscribed (the set is left unchanged).
    pub fn join(&self, room: RoomId, session: &SessionHandle) -> bool {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let entry = rooms.entry(room).or_default();
        let mut subscribers = entry.lock();

        if subscribers.contains_key(&session.id) {
            return false;
        }
        subscribers.insert(
            session.id,
            Subscriber {
                handle: session.clone(),
                dropped: 0,
            },
        );

        debug!(room, subs = subscribers.len(), "registry: {} joined", session.user.username);
        true
    }

    /// Remove the session from the room, pruning the room once empty.
    /// Returns whether a subscription was actually removed.
    pub fn leave(&self, room: RoomId, session: SessionId) -> bool {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = rooms.get(&room) else {
            return false;
        };

        let (removed, now_empty) = {
            let mut subscribers = entry.lock();
            let removed = subscribers.remove(&session).is_some();
            (removed, subscribers.is_empty())
        };

        if now_empty {
            rooms.remove(&room);
        }

        debug!(room, removed, "registry: session {} left", session);
        removed
    }

    /// Deliver `event` to every current subscriber of `room`. Best effort:
    /// a full or closed queue skips that subscriber only. Returns the number
    /// of subscribers the event was queued for.
    pub fn broadcast(&self, room: RoomId, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = rooms.get(&room) else {
            return 0;
        };

        let mut subscribers = entry.lock();
        let mut delivered = 0;

        for sub in subscribers.values_mut() {
            match sub.handle.tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped = sub.dropped.saturating_add(1);
                    warn!(
                        room,
                        dropped = sub.dropped,
                        "Subscriber {} lagging, event dropped",
                        sub.handle.user.username
                    );
                }
                // Connection is tearing down; its guard will leave shortly.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        delivered
    }

    pub fn subscriber_count(&self, room: RoomId) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        rooms.get(&room).map_or(0, |entry| entry.lock().len())
    }

    pub fn is_subscribed(&self, room: RoomId, session: SessionId) -> bool {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        rooms
            .get(&room)
            .is_some_and(|entry| entry.lock().contains_key(&session))
    }

    /// Number of rooms with at least one subscriber.
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Join and return a guard that leaves when dropped.
    pub fn subscribe(&self, room: RoomId, session: &SessionHandle) -> RoomSubscription {
        self.join(room, session);
        RoomSubscription {
            registry: self.clone(),
            room,
            session: session.id,
            active: true,
        }
    }
}

/// Scoped membership in a room's live subscriber set. Leaves exactly once,
/// either through `release` or on drop.
pub struct RoomSubscription {
    registry: SessionRegistry,
    room: RoomId,
    session: SessionId,
    active: bool,
}

impl RoomSubscription {
    pub fn release(mut self) -> bool {
        self.leave_once()
    }

    fn leave_once(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.registry.leave(self.room, self.session)
    }
}

impl Drop for RoomSubscription {
    fn drop(&mut self) {
        self.leave_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lobby_types::models::MessageKind;

    fn user(name: &str) -> UserIdentity {
        UserIdentity {
            id: Uuid::new_v4(),
            username: name.into(),
        }
    }

    fn event(text: &str) -> ServerEvent {
        ServerEvent::ChatMessage {
            user: "alice".into(),
            message: text.into(),
            message_type: MessageKind::Text,
            timestamp: Utc::now(),
            file: None,
        }
    }

    fn text_of(event: &ServerEvent) -> &str {
        match event {
            ServerEvent::ChatMessage { message, .. } => message,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_join_is_idempotent() {
        let registry = SessionRegistry::new(8);
        let (alice, _rx) = registry.open_session(user("alice"));

        assert!(registry.join(1, &alice));
        assert!(!registry.join(1, &alice));
        assert_eq!(registry.subscriber_count(1), 1);
    }

    #[test]
    fn test_join_then_leave_restores_set() {
        let registry = SessionRegistry::new(8);
        let (alice, _a) = registry.open_session(user("alice"));
        let (bob, _b) = registry.open_session(user("bob"));

        registry.join(1, &alice);
        assert_eq!(registry.subscriber_count(1), 1);

        registry.join(1, &bob);
        assert!(registry.leave(1, bob.id));
        assert_eq!(registry.subscriber_count(1), 1);
        assert!(registry.is_subscribed(1, alice.id));
        assert!(!registry.is_subscribed(1, bob.id));

        assert!(!registry.leave(1, bob.id));
        assert!(registry.leave(1, alice.id));
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_scoped_to_room() {
        let registry = SessionRegistry::new(8);
        let (alice, mut alice_rx) = registry.open_session(user("alice"));
        let (bob, mut bob_rx) = registry.open_session(user("bob"));
        let (carol, mut carol_rx) = registry.open_session(user("carol"));

        registry.join(1, &alice);
        registry.join(1, &bob);
        registry.join(2, &carol);

        assert_eq!(registry.broadcast(1, event("hello")), 2);
        assert_eq!(text_of(&alice_rx.recv().await.unwrap()), "hello");
        assert_eq!(text_of(&bob_rx.recv().await.unwrap()), "hello");
        assert!(carol_rx.try_recv().is_err());

        assert_eq!(registry.broadcast(3, event("nobody")), 0);
    }

    #[tokio::test]
    async fn test_broadcast_order_preserved_per_subscriber() {
        let registry = SessionRegistry::new(64);
        let (alice, mut rx) = registry.open_session(user("alice"));
        registry.join(1, &alice);

        for i in 0..20 {
            registry.broadcast(1, event(&i.to_string()));
        }
        for i in 0..20 {
            assert_eq!(text_of(&rx.recv().await.unwrap()), i.to_string());
        }
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block_others() {
        let registry = SessionRegistry::new(1);
        let (slow, _slow_rx) = registry.open_session(user("slow"));
        let (fast, mut fast_rx) = registry.open_session(user("fast"));
        registry.join(1, &slow);
        registry.join(1, &fast);

        assert_eq!(registry.broadcast(1, event("one")), 2);
        assert_eq!(text_of(&fast_rx.recv().await.unwrap()), "one");

        // slow never reads, so its single slot stays full
        assert_eq!(registry.broadcast(1, event("two")), 1);
        assert_eq!(text_of(&fast_rx.recv().await.unwrap()), "two");
    }

    #[tokio::test]
    async fn test_closed_receiver_is_skipped() {
        let registry = SessionRegistry::new(4);
        let (gone, gone_rx) = registry.open_session(user("gone"));
        let (here, mut here_rx) = registry.open_session(user("here"));
        registry.join(1, &gone);
        registry.join(1, &here);
        drop(gone_rx);

        assert_eq!(registry.broadcast(1, event("still")), 1);
        assert_eq!(text_of(&here_rx.recv().await.unwrap()), "still");
    }

    #[test]
    fn test_subscription_guard_leaves_once() {
        let registry = SessionRegistry::new(4);
        let (alice, _rx) = registry.open_session(user("alice"));

        {
            let _sub = registry.subscribe(7, &alice);
            assert!(registry.is_subscribed(7, alice.id));
        }
        assert!(!registry.is_subscribed(7, alice.id));

        let sub = registry.subscribe(7, &alice);
        assert!(sub.release());
        assert_eq!(registry.subscriber_count(7), 0);
    }

    #[test]
    fn test_concurrent_join_leave() {
        let registry = SessionRegistry::new(4);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let (session, _rx) = registry.open_session(user(&format!("u{i}")));
                    for _ in 0..200 {
                        registry.join(1, &session);
                        registry.broadcast(1, event("x"));
                        assert!(registry.leave(1, session.id));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.subscriber_count(1), 0);
        assert_eq!(registry.room_count(), 0);
    }
}
