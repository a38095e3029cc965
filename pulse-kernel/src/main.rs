/**
 * PULSE KERNEL - Point d'entrée du registre de vivacité de la flotte
 *
 * RÔLE : Orchestration de tous les modules : config, store, admission,
 * ingestion, sweeper, fanout, HTTP, MQTT. Bootstrap complet avec gestion
 * d'erreurs et logging.
 *
 * ARCHITECTURE : agents -> ingestion (HTTP/MQTT) -> store -> fanout vers les
 * observateurs ; sweeper périodique contre le même store.
 * UTILITÉ : source de vérité unique du statut running/stopped/maintenance.
 */

mod admission;
mod config;
mod fanout;
mod http;
mod ingest;
mod models;
mod mqtt;
mod state;
mod store;
mod sweeper;

use crate::admission::AdmissionList;
use crate::config::load_config;
use crate::fanout::Broadcaster;
use crate::http::AppState;
use crate::ingest::Ingestor;
use crate::store::NodeStore;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas

    let cfg = load_config().await;

    std::fs::create_dir_all(&cfg.data_dir).unwrap_or_else(|e| {
        eprintln!("[kernel] warning: failed to create data dir: {}", e);
    });
    let data_dir = Path::new(&cfg.data_dir);

    // fanout d'abord : le store publie ses transitions dedans
    let broadcaster = Broadcaster::default();

    let store = Arc::new(
        NodeStore::new(data_dir.join("nodes.json")).with_broadcaster(broadcaster.clone()),
    );
    if let Err(e) = store.load().await {
        eprintln!("[kernel] failed to load nodes: {e}");
    }

    let admission = Arc::new(AdmissionList::new(data_dir.join("clients.json")));
    if let Err(e) = admission.load().await {
        eprintln!("[kernel] failed to load allowed clients: {e}");
    }

    let ingestor = Arc::new(Ingestor::new(
        store.clone(),
        admission.clone(),
        cfg.admission_required,
    ));

    // canal push : updates entrants + status_changed sortants
    match cfg.mqtt.clone() {
        Some(mqtt_cfg) => {
            mqtt::spawn_update_listener(ingestor.clone(), mqtt_cfg.clone());
            mqtt::spawn_status_publisher(broadcaster.clone(), mqtt_cfg);
        }
        None => println!("[kernel] no MQTT broker configured, HTTP surface only"),
    }

    sweeper::spawn_sweeper(store.clone(), cfg.sweep_interval_secs, cfg.stale_after_secs);

    let app_state = AppState {
        store: store.clone(),
        admission: admission.clone(),
        ingestor,
        stale_after_secs: cfg.stale_after_secs,
    };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    println!("[kernel] listening on http://{addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            println!("[kernel] shutdown requested");
        })
        .await?;

    // dernier snapshot : les sections critiques sont synchrones, toute
    // transaction d'enregistrement en vol est terminée ici
    if let Err(e) = store.save().await {
        eprintln!("[kernel] final nodes save failed: {e}");
    }
    if let Err(e) = admission.save().await {
        eprintln!("[kernel] final clients save failed: {e}");
    }
    Ok(())
}
