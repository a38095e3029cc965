/**
 * FANOUT BROADCASTER - Diffusion des transitions de statut aux observateurs
 *
 * RÔLE :
 * Pousser chaque transition running/stopped/maintenance vers tous les
 * observateurs connectés, sans jamais ralentir l'ingestion ni le sweeper.
 *
 * FONCTIONNEMENT :
 * - Canal broadcast borné : publish = dépôt non bloquant, un receiver par observateur
 * - Observateur lent : il "lag", les événements les plus anciens sont perdus
 * - Pas de replay à la reconnexion : la fraîcheur vient du pull (GET /nodes)
 * - Ordre causal garanti par nœud (publication dans la section critique du store)
 */

use crate::models::{NodeRecord, NodeStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use uuid::Uuid;

pub const DEFAULT_CAPACITY: usize = 256;

/// Transition de statut acceptée par le store, avec snapshot complet du nœud.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub event_id: String, // UUID : permet aux observateurs best-effort de dédupliquer
    pub node_id: String,
    pub old_status: NodeStatus,
    pub new_status: NodeStatus,
    pub node: NodeRecord,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

impl StatusEvent {
    pub fn new(old_status: NodeStatus, node: NodeRecord) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            node_id: node.id.clone(),
            old_status,
            new_status: node.status,
            at: OffsetDateTime::now_utc(),
            node,
        }
    }
}

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<StatusEvent>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget : jamais bloquant, silencieux sans observateur.
    pub fn publish(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }

    /// Chaque observateur détient son receiver ; le drop le récupère aussitôt.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    fn event(name: &str, old: NodeStatus, new: NodeStatus) -> StatusEvent {
        let mut node = NodeRecord::provisioned(name, 0, OffsetDateTime::now_utc());
        node.status = new;
        StatusEvent::new(old, node)
    }

    #[test]
    fn test_publish_without_observers_is_noop() {
        let broadcaster = Broadcaster::new(4);
        broadcaster.publish(event("edge-1", NodeStatus::Running, NodeStatus::Stopped));
        assert_eq!(broadcaster.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_observer_receives_events_in_publish_order() {
        let broadcaster = Broadcaster::new(8);
        let mut rx = broadcaster.subscribe();

        broadcaster.publish(event("edge-1", NodeStatus::Maintenance, NodeStatus::Running));
        broadcaster.publish(event("edge-1", NodeStatus::Running, NodeStatus::Stopped));
        broadcaster.publish(event("edge-1", NodeStatus::Stopped, NodeStatus::Running));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(first.new_status, NodeStatus::Running);
        assert_eq!(second.new_status, NodeStatus::Stopped);
        assert_eq!(third.new_status, NodeStatus::Running);
        assert_eq!(second.old_status, first.new_status);
        assert_eq!(third.old_status, second.new_status);
    }

    #[tokio::test]
    async fn test_slow_observer_loses_oldest_events() {
        let broadcaster = Broadcaster::new(2);
        let mut rx = broadcaster.subscribe();

        for i in 0..4 {
            let status = if i % 2 == 0 { NodeStatus::Stopped } else { NodeStatus::Running };
            broadcaster.publish(event(&format!("edge-{i}"), NodeStatus::Running, status));
        }

        // les deux premiers événements sont perdus, pas de blocage du publisher
        match rx.recv().await {
            Err(RecvError::Lagged(skipped)) => assert_eq!(skipped, 2),
            other => panic!("expected lag, got {other:?}"),
        }
        let third = rx.recv().await.unwrap();
        assert_eq!(third.node.name, "edge-2");
        let fourth = rx.recv().await.unwrap();
        assert_eq!(fourth.node.name, "edge-3");
    }

    #[tokio::test]
    async fn test_dropped_observer_is_reclaimed() {
        let broadcaster = Broadcaster::new(4);
        let rx1 = broadcaster.subscribe();
        let rx2 = broadcaster.subscribe();
        assert_eq!(broadcaster.observer_count(), 2);
        drop(rx1);
        assert_eq!(broadcaster.observer_count(), 1);
        drop(rx2);
        assert_eq!(broadcaster.observer_count(), 0);
    }
}
