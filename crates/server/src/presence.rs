use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use shared::{
    domain::{ConversationId, UserId},
    protocol::PushEvent,
};
use tokio::sync::broadcast;
use tracing::debug;

/// Connection-counted presence roster plus the broadcast fanout behind the
/// push channel. A user with several open sockets stays online until the
/// last one closes.
#[derive(Clone)]
pub(crate) struct PresenceRegistry {
    connections: Arc<Mutex<HashMap<UserId, usize>>>,
    events: broadcast::Sender<PushEvent>,
}

impl PresenceRegistry {
    pub(crate) fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PushEvent> {
        self.events.subscribe()
    }

    pub(crate) fn connect(&self, user_id: UserId) {
        {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            *connections.entry(user_id).or_insert(0) += 1;
        }
        debug!(user_id = user_id.0, "push channel connected");
        self.broadcast_roster();
    }

    pub(crate) fn disconnect(&self, user_id: UserId) {
        {
            let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(count) = connections.get_mut(&user_id) {
                *count -= 1;
                if *count == 0 {
                    connections.remove(&user_id);
                }
            }
        }
        debug!(user_id = user_id.0, "push channel disconnected");
        self.broadcast_roster();
    }

    pub(crate) fn typing_started(&self, from: UserId, conversation_id: ConversationId) {
        let _ = self.events.send(PushEvent::TypingStarted {
            from,
            conversation_id,
        });
    }

    pub(crate) fn typing_stopped(&self, from: UserId, conversation_id: ConversationId) {
        let _ = self.events.send(PushEvent::TypingStopped {
            from,
            conversation_id,
        });
    }

    pub(crate) fn online_user_ids(&self) -> Vec<UserId> {
        let connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        let mut online: Vec<UserId> = connections.keys().copied().collect();
        online.sort();
        online
    }

    fn broadcast_roster(&self) {
        let _ = self.events.send(PushEvent::PresenceUpdate {
            online_user_ids: self.online_user_ids(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_counts_connections_per_user() {
        let registry = PresenceRegistry::new(16);
        let alice = UserId(1);

        registry.connect(alice);
        registry.connect(alice);
        registry.disconnect(alice);
        assert_eq!(registry.online_user_ids(), vec![alice]);

        registry.disconnect(alice);
        assert!(registry.online_user_ids().is_empty());
    }

    #[tokio::test]
    async fn connect_broadcasts_a_sorted_roster() {
        let registry = PresenceRegistry::new(16);
        let mut rx = registry.subscribe();

        registry.connect(UserId(7));
        registry.connect(UserId(3));

        let first = rx.recv().await.expect("event");
        assert!(matches!(
            first,
            PushEvent::PresenceUpdate { ref online_user_ids } if online_user_ids == &[UserId(7)]
        ));
        let second = rx.recv().await.expect("event");
        assert!(matches!(
            second,
            PushEvent::PresenceUpdate { ref online_user_ids }
                if online_user_ids == &[UserId(3), UserId(7)]
        ));
    }

    #[tokio::test]
    async fn typing_signals_are_rebroadcast_verbatim() {
        let registry = PresenceRegistry::new(16);
        let mut rx = registry.subscribe();

        registry.typing_started(UserId(2), ConversationId(9));
        let event = rx.recv().await.expect("event");
        assert!(matches!(
            event,
            PushEvent::TypingStarted { from, conversation_id }
                if from == UserId(2) && conversation_id == ConversationId(9)
        ));
    }
}
