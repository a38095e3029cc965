/**
 * NODE STORE - Registre des nœuds de la flotte, unique source de vérité
 *
 * RÔLE :
 * Table concurrente id -> enregistrement, avec la machine à états
 * running/stopped/maintenance et le balayage des nœuds silencieux.
 *
 * FONCTIONNEMENT :
 * - Deux niveaux de verrous : RwLock sur la map, Mutex par enregistrement.
 *   Les writers d'un même nœud se sérialisent, les autres nœuds restent libres,
 *   aucun verrou global n'est tenu pendant un list() ou un sweep complet.
 * - Les transitions publient leur événement dans la section critique de
 *   l'enregistrement : l'ordre des événements d'un nœud suit l'ordre des mutations.
 * - Persistance snapshot JSON (nodes.json), chargée au boot, sauvée sur les
 *   actions opérateur et après un sweep effectif. On ne sauvegarde pas
 *   chaque heartbeat.
 *
 * UTILITÉ DANS PULSE :
 * 🎯 Ingestion : apply_update applique un payload normalisé
 * 🎯 Sweeper : sweep_stale rétrograde les running silencieux
 * 🎯 API : list/get/force_status/set_order/delete
 */

use crate::fanout::{Broadcaster, StatusEvent};
use crate::models::{node_id_for, CoreError, NodeFields, NodeRecord, NodeStatus};
use crate::state::{new_shared, Shared, SharedTable};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};

pub struct NodeStore {
    nodes: SharedTable<HashMap<String, Shared<NodeRecord>>>,
    data_file: PathBuf,
    broadcaster: Option<Broadcaster>,
}

impl NodeStore {
    pub fn new<P: AsRef<Path>>(data_file: P) -> Self {
        Self {
            nodes: SharedTable::new(HashMap::new()),
            data_file: data_file.as_ref().to_path_buf(),
            broadcaster: None,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Broadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Charge le snapshot JSON. Les nœuds persistés `running` redeviennent
    /// `stopped` : leur vivacité est inconnue après un redémarrage, le
    /// prochain update accepté les repromouvra.
    pub async fn load(&self) -> Result<usize, CoreError> {
        if !self.data_file.exists() {
            println!("[store] no existing nodes file, starting fresh");
            return Ok(0);
        }
        let content = tokio::fs::read_to_string(&self.data_file).await?;
        let mut records: HashMap<String, NodeRecord> = serde_json::from_str(&content)?;
        for record in records.values_mut() {
            if record.status == NodeStatus::Running {
                record.status = NodeStatus::Stopped;
            }
        }
        let count = records.len();
        {
            let mut map = self.nodes.write();
            *map = records.into_iter().map(|(id, rec)| (id, new_shared(rec))).collect();
        }
        println!("[store] loaded {} nodes from {}", count, self.data_file.display());
        Ok(count)
    }

    /// Sauvegarde le snapshot complet vers nodes.json.
    pub async fn save(&self) -> Result<(), CoreError> {
        let snapshot: HashMap<String, NodeRecord> = {
            let map = self.nodes.read();
            map.iter().map(|(id, handle)| (id.clone(), handle.lock().clone())).collect()
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&self.data_file, content).await?;
        Ok(())
    }

    fn handle(&self, id: &str) -> Option<Shared<NodeRecord>> {
        self.nodes.read().get(id).cloned()
    }

    fn publish(&self, event: StatusEvent) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.publish(event);
        }
    }

    pub fn get(&self, id: &str) -> Result<NodeRecord, CoreError> {
        self.handle(id)
            .map(|handle| handle.lock().clone())
            .ok_or_else(|| CoreError::NotFound(id.to_string()))
    }

    /// Snapshot trié : order_index décroissant, premiers vus d'abord à égalité.
    pub fn list(&self) -> Vec<NodeRecord> {
        let handles: Vec<Shared<NodeRecord>> = self.nodes.read().values().cloned().collect();
        let mut records: Vec<NodeRecord> = handles.iter().map(|h| h.lock().clone()).collect();
        records.sort_by(|a, b| {
            b.order_index
                .cmp(&a.order_index)
                .then(a.first_seen.cmp(&b.first_seen))
        });
        records
    }

    /// Nouvel enregistrement en dessous des existants (comportement d'affichage
    /// historique : le dernier arrivé se liste en dernier).
    fn next_order_index(map: &HashMap<String, Shared<NodeRecord>>) -> i64 {
        map.values()
            .map(|handle| handle.lock().order_index)
            .min()
            .map(|min| min - 1)
            .unwrap_or(0)
    }

    /// Provisionne l'enregistrement d'un client fraîchement admis (idempotent) :
    /// maintenance + métriques placeholder jusqu'au premier rapport.
    pub fn register(&self, name: &str) -> NodeRecord {
        let id = node_id_for(name);
        let mut map = self.nodes.write();
        if let Some(handle) = map.get(&id) {
            return handle.lock().clone();
        }
        let order_index = Self::next_order_index(&map);
        let record = NodeRecord::provisioned(name, order_index, OffsetDateTime::now_utc());
        map.insert(id, new_shared(record.clone()));
        println!("[store] registered node {} ({})", record.id, record.name);
        record
    }

    /// Applique un update accepté. Crée l'enregistrement au besoin, copie la
    /// télémétrie, avance last_update, et promeut en running sauf maintenance
    /// collante. L'admission a déjà été contrôlée en amont.
    pub fn apply_update(&self, fields: NodeFields) -> Result<NodeRecord, CoreError> {
        let id = node_id_for(&fields.name);
        let handle = match self.handle(&id) {
            Some(handle) => handle,
            None => {
                let mut map = self.nodes.write();
                // un autre writer a pu créer l'entrée entre les deux verrous
                if let Some(handle) = map.get(&id) {
                    handle.clone()
                } else {
                    let order_index = Self::next_order_index(&map);
                    let handle = new_shared(NodeRecord::provisioned(
                        &fields.name,
                        order_index,
                        OffsetDateTime::now_utc(),
                    ));
                    map.insert(id.clone(), handle.clone());
                    handle
                }
            }
        };

        // section critique par enregistrement : mutation puis publication
        let mut record = handle.lock();
        let old_status = record.status;
        record.ip_address = fields.ip_address;
        record.metrics = fields.metrics;
        record.last_update = OffsetDateTime::now_utc();
        if record.provisional {
            // premier rapport d'un nœud provisionné : il entre en service
            record.provisional = false;
            record.status = NodeStatus::Running;
        } else if record.status == NodeStatus::Stopped {
            record.status = NodeStatus::Running;
        }
        // maintenance non provisoire : le statut ne bouge pas, la télémétrie si
        let snapshot = record.clone();
        if snapshot.status != old_status {
            self.publish(StatusEvent::new(old_status, snapshot.clone()));
        }
        Ok(snapshot)
    }

    /// Action opérateur : force le statut, seul chemin d'entrée et de sortie
    /// de la maintenance. Ne touche pas last_update.
    pub fn force_status(&self, id: &str, status: NodeStatus) -> Result<NodeRecord, CoreError> {
        let handle = self.handle(id).ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        let mut record = handle.lock();
        let old_status = record.status;
        record.status = status;
        // l'opérateur a statué : une maintenance devient collante
        record.provisional = false;
        let snapshot = record.clone();
        if snapshot.status != old_status {
            println!(
                "[store] forced node {} ({}) {} -> {}",
                snapshot.id, snapshot.name, old_status, snapshot.status
            );
            self.publish(StatusEvent::new(old_status, snapshot.clone()));
        }
        Ok(snapshot)
    }

    pub fn set_order(&self, id: &str, order_index: i64) -> Result<NodeRecord, CoreError> {
        let handle = self.handle(id).ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        let mut record = handle.lock();
        record.order_index = order_index;
        Ok(record.clone())
    }

    pub fn delete(&self, id: &str) -> Result<NodeRecord, CoreError> {
        let handle = self
            .nodes
            .write()
            .remove(id)
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        let removed = handle.lock().clone();
        println!("[store] deleted node {} ({})", removed.id, removed.name);
        Ok(removed)
    }

    /// Compare-and-set par enregistrement : les running silencieux depuis plus
    /// de `stale_after` passent stopped. last_update n'est jamais reculé.
    /// Idempotent : un second passage immédiat ne change rien.
    pub fn sweep_stale(&self, stale_after: Duration) -> Vec<StatusEvent> {
        let now = OffsetDateTime::now_utc();
        let handles: Vec<Shared<NodeRecord>> = self.nodes.read().values().cloned().collect();
        let mut demoted = Vec::new();
        for handle in handles {
            let mut record = handle.lock();
            if record.status == NodeStatus::Running && now - record.last_update > stale_after {
                record.status = NodeStatus::Stopped;
                let event = StatusEvent::new(NodeStatus::Running, record.clone());
                self.publish(event.clone());
                demoted.push(event);
            }
        }
        demoted
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_update(&self, id: &str, secs: i64) {
        if let Some(handle) = self.handle(id) {
            let mut record = handle.lock();
            record.last_update -= Duration::seconds(secs);
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate_first_seen(&self, id: &str, secs: i64) {
        if let Some(handle) = self.handle(id) {
            let mut record = handle.lock();
            record.first_seen -= Duration::seconds(secs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UpdateIn;

    fn update_for(name: &str, cpu: f32) -> NodeFields {
        UpdateIn {
            id: Some(format!("{name}-machine")),
            name: Some(name.to_string()),
            cpu: Some(cpu),
            ip_address: Some("203.0.113.7".into()),
            ..Default::default()
        }
        .normalize()
        .unwrap()
    }

    #[test]
    fn test_register_creates_provisional_maintenance() {
        let store = NodeStore::new("unused.json");
        let record = store.register("edge-1");
        assert_eq!(record.status, NodeStatus::Maintenance);
        assert!(record.provisional);
        assert_eq!(record.id, node_id_for("edge-1"));
        assert_eq!(record.metrics.cpu, 0.0);
        assert_eq!(record.metrics.os_type, "Unknown");
        assert!(record.first_seen <= record.last_update);

        // idempotent : re-register renvoie l'existant
        let again = store.register("edge-1");
        assert_eq!(again.id, record.id);
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn test_first_update_promotes_provisioned_node() {
        let broadcaster = Broadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        let store = NodeStore::new("unused.json").with_broadcaster(broadcaster);

        store.register("edge-1");
        let record = store.apply_update(update_for("edge-1", 10.0)).unwrap();
        assert_eq!(record.status, NodeStatus::Running);
        assert!(!record.provisional);
        assert_eq!(record.metrics.cpu, 10.0);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.old_status, NodeStatus::Maintenance);
        assert_eq!(event.new_status, NodeStatus::Running);
        assert_eq!(event.node_id, record.id);
    }

    #[test]
    fn test_update_advances_last_update_and_is_idempotent_otherwise() {
        let store = NodeStore::new("unused.json");
        store.register("edge-1");
        let first = store.apply_update(update_for("edge-1", 10.0)).unwrap();
        store.backdate_last_update(&first.id, 1);
        let before = store.get(&first.id).unwrap().last_update;
        let second = store.apply_update(update_for("edge-1", 10.0)).unwrap();
        assert!(second.last_update > before);
        assert_eq!(second.status, first.status);
        assert_eq!(second.metrics, first.metrics);
        assert_eq!(second.order_index, first.order_index);
        assert_eq!(second.first_seen, first.first_seen);
    }

    #[test]
    fn test_sticky_maintenance_ignores_updates() {
        let store = NodeStore::new("unused.json");
        store.register("edge-1");
        let record = store.apply_update(update_for("edge-1", 10.0)).unwrap();
        store.force_status(&record.id, NodeStatus::Maintenance).unwrap();

        let updated = store.apply_update(update_for("edge-1", 99.0)).unwrap();
        assert_eq!(updated.status, NodeStatus::Maintenance);
        // la télémétrie continue d'arriver pendant la maintenance
        assert_eq!(updated.metrics.cpu, 99.0);
    }

    #[test]
    fn test_forced_maintenance_before_first_report_is_sticky() {
        let store = NodeStore::new("unused.json");
        let record = store.register("edge-1");
        store.force_status(&record.id, NodeStatus::Maintenance).unwrap();
        let updated = store.apply_update(update_for("edge-1", 5.0)).unwrap();
        assert_eq!(updated.status, NodeStatus::Maintenance);
    }

    #[test]
    fn test_force_status_emits_event_only_on_change() {
        let broadcaster = Broadcaster::new(8);
        let mut rx = broadcaster.subscribe();
        let store = NodeStore::new("unused.json").with_broadcaster(broadcaster);
        let record = store.register("edge-1");

        let unchanged = store.force_status(&record.id, NodeStatus::Maintenance).unwrap();
        assert_eq!(unchanged.status, NodeStatus::Maintenance);
        assert!(rx.try_recv().is_err());

        store.force_status(&record.id, NodeStatus::Running).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.old_status, NodeStatus::Maintenance);
        assert_eq!(event.new_status, NodeStatus::Running);
    }

    #[test]
    fn test_force_status_does_not_touch_last_update() {
        let store = NodeStore::new("unused.json");
        let record = store.register("edge-1");
        let before = store.get(&record.id).unwrap().last_update;
        let forced = store.force_status(&record.id, NodeStatus::Running).unwrap();
        assert_eq!(forced.last_update, before);
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let store = NodeStore::new("unused.json");
        assert!(matches!(store.get("nope"), Err(CoreError::NotFound(_))));
        assert!(matches!(
            store.force_status("nope", NodeStatus::Running),
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(store.set_order("nope", 3), Err(CoreError::NotFound(_))));
        assert!(matches!(store.delete("nope"), Err(CoreError::NotFound(_))));
    }

    #[test]
    fn test_list_orders_by_order_index_then_first_seen() {
        let store = NodeStore::new("unused.json");
        let a = store.register("alpha"); // order 0
        let b = store.register("bravo"); // order -1
        let c = store.register("charlie"); // order -2
        assert_eq!(a.order_index, 0);
        assert_eq!(b.order_index, -1);
        assert_eq!(c.order_index, -2);

        // ordre par défaut : ordre d'enregistrement
        let names: Vec<String> = store.list().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alpha", "bravo", "charlie"]);

        // bravo épinglé en tête, alpha et charlie à égalité départagés par first_seen
        store.set_order(&b.id, 10).unwrap();
        store.set_order(&a.id, 5).unwrap();
        store.set_order(&c.id, 5).unwrap();
        store.backdate_first_seen(&a.id, 60);
        let names: Vec<String> = store.list().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["bravo", "alpha", "charlie"]);
    }

    #[test]
    fn test_delete_removes_record() {
        let store = NodeStore::new("unused.json");
        let record = store.register("edge-1");
        let removed = store.delete(&record.id).unwrap();
        assert_eq!(removed.name, "edge-1");
        assert!(matches!(store.get(&record.id), Err(CoreError::NotFound(_))));
        assert!(store.list().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_demotes_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");

        let store = NodeStore::new(&path);
        store.register("edge-1");
        store.apply_update(update_for("edge-1", 10.0)).unwrap();
        store.register("edge-2"); // reste provisionné en maintenance
        store.save().await.unwrap();

        let reloaded = NodeStore::new(&path);
        assert_eq!(reloaded.load().await.unwrap(), 2);

        // running persisté -> stopped : vivacité inconnue après redémarrage
        let edge1 = reloaded.get(&node_id_for("edge-1")).unwrap();
        assert_eq!(edge1.status, NodeStatus::Stopped);
        assert_eq!(edge1.metrics.cpu, 10.0);
        assert_eq!(edge1.ip_address, "203.0.113.7");

        let edge2 = reloaded.get(&node_id_for("edge-2")).unwrap();
        assert_eq!(edge2.status, NodeStatus::Maintenance);
        assert!(edge2.provisional);
    }

    #[tokio::test]
    async fn test_load_missing_file_starts_fresh() {
        let store = NodeStore::new("definitely/not/here.json");
        assert_eq!(store.load().await.unwrap(), 0);
    }
}
