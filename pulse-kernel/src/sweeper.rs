/**
 * LIVENESS SWEEPER - Rétrogradation périodique des nœuds silencieux
 *
 * RÔLE :
 * Toutes les P secondes, passer les nœuds running muets depuis plus de T
 * secondes en stopped. Seul chemin de rétrogradation automatique.
 *
 * FONCTIONNEMENT :
 * - Le balayage délègue au store (compare-and-set par enregistrement) :
 *   aucun verrou global, les writers concurrents ne sont jamais bloqués
 * - Sweep sans rétrogradation = no-op, aucun événement, pas de sauvegarde
 * - Échec de persistance : loggé, le prochain tick réessaiera
 */

use crate::store::NodeStore;
use std::sync::Arc;
use time::Duration;

pub fn spawn_sweeper(store: Arc<NodeStore>, sweep_interval_secs: u64, stale_after_secs: u64) {
    println!(
        "[sweeper] starting (period: {}s, stale after: {}s)",
        sweep_interval_secs, stale_after_secs
    );

    tokio::spawn(async move {
        let stale_after = Duration::seconds(stale_after_secs as i64);
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(sweep_interval_secs.max(1)));

        loop {
            interval.tick().await;

            let demoted = store.sweep_stale(stale_after);
            if demoted.is_empty() {
                continue;
            }
            for event in &demoted {
                println!(
                    "[sweeper] node {} ({}) silent for more than {}s -> stopped",
                    event.node_id, event.node.name, stale_after_secs
                );
            }
            if let Err(e) = store.save().await {
                eprintln!("[sweeper] failed to save after sweep: {e}");
            }
        }
    });
}
