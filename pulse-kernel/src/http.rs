/**
 * API REST PULSE - Surface HTTP du kernel + façade de lecture
 *
 * RÔLE :
 * Ce module expose l'API REST du kernel : push des agents, lectures pour les
 * dashboards, actions opérateur sur les nœuds et la liste d'admission.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key
 * - Routes publiques : /health, POST /nodes/update (les agents n'ont pas de
 *   clé admin), GET /nodes* (lectures, expurgées sans clé)
 * - Tout le reste exige x-api-key (actions opérateur)
 * - Gestion erreurs HTTP standardisée (400, 403, 404, 503)
 *
 * SÉCURITÉ :
 * - La même clé décide de l'expurgation des lectures : sans clé valide,
 *   ip_address est masquée dans chaque vue renvoyée, le store n'est jamais
 *   modifié par une lecture
 */

use crate::admission::{AdmissionList, AllowedClient};
use crate::ingest::Ingestor;
use crate::models::{CoreError, NodeMetrics, NodeRecord, NodeStatus, UpdateIn};
use crate::store::NodeStore;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

/// Valeur renvoyée à la place de l'IP aux lecteurs non authentifiés.
pub const MASKED_IP: &str = "hidden";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<NodeStore>,
    pub admission: Arc<AdmissionList>,
    pub ingestor: Arc<Ingestor>,
    pub stale_after_secs: u64,
}

impl AppState {
    fn stale_after(&self) -> Duration {
        Duration::seconds(self.stale_after_secs as i64)
    }
}

#[derive(Debug, serde::Serialize)]
struct NodeView {
    id: String,
    name: String,
    status: NodeStatus,
    ip_address: String,
    metrics: NodeMetrics,
    order_index: i64,
    first_seen: String, // format RFC3339 pour l'API
    last_update: String,
    stale: bool,
    stale_for_seconds: i64, // âge du dernier rapport en secondes
}

fn to_view(record: &NodeRecord, authenticated: bool, stale_after: Duration) -> NodeView {
    let now = OffsetDateTime::now_utc();
    let age = now - record.last_update;
    NodeView {
        id: record.id.clone(),
        name: record.name.clone(),
        status: record.status,
        ip_address: if authenticated {
            record.ip_address.clone()
        } else {
            MASKED_IP.to_string()
        },
        metrics: record.metrics.clone(),
        order_index: record.order_index,
        first_seen: record.first_seen.format(&Rfc3339).unwrap_or_default(),
        last_update: record.last_update.format(&Rfc3339).unwrap_or_default(),
        stale: age > stale_after,
        stale_for_seconds: age.whole_seconds().max(0),
    }
}

fn api_key_matches(headers: &HeaderMap) -> bool {
    let expected = std::env::var("PULSE_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        return false;
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false)
}

// Routes accessibles sans clé : health check, push agent, lectures expurgées.
fn is_public(method: &Method, path: &str) -> bool {
    path.starts_with("/health")
        || (*method == Method::POST && path == "/nodes/update")
        || (*method == Method::GET && path.starts_with("/nodes"))
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if is_public(req.method(), req.uri().path()) {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("PULSE_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        eprintln!("SECURITY: PULSE_API_KEY not set - operator API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    if !api_key_matches(req.headers()) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/nodes/update", post(update_node))
        .route("/nodes", get(get_nodes))
        .route("/nodes/{id}", get(get_node).delete(delete_node))
        .route("/nodes/{id}/status", put(put_status))
        .route("/nodes/{id}/order", put(put_order))
        .route("/admission", get(get_admission).post(post_admission))
        .route("/admission/{name}", delete(delete_admission))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

fn error_response(err: CoreError) -> (StatusCode, Json<serde_json::Value>) {
    let code = match &err {
        CoreError::NotAllowed(_) => StatusCode::FORBIDDEN,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
        CoreError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(json!({ "ok": false, "error": err.to_string() })))
}

/// Les actions opérateur persistent les snapshots aussitôt ; un échec remonte
/// comme indisponibilité transitoire (503), la mutation mémoire reste acquise.
async fn persist(app: &AppState) -> Result<(), CoreError> {
    app.store.save().await?;
    app.admission.save().await
}

// POST /nodes/update (push agent, mêmes sémantiques que update@v1 côté MQTT)
async fn update_node(
    State(app): State<AppState>,
    Json(payload): Json<UpdateIn>,
) -> (StatusCode, Json<serde_json::Value>) {
    match app.ingestor.apply(payload) {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({ "ok": true, "id": record.id, "status": record.status })),
        ),
        Err(e) => error_response(e),
    }
}

// GET /nodes (liste triée, expurgée sans clé)
async fn get_nodes(State(app): State<AppState>, headers: HeaderMap) -> Json<Vec<NodeView>> {
    let authenticated = api_key_matches(&headers);
    let stale_after = app.stale_after();
    let list: Vec<NodeView> = app
        .store
        .list()
        .iter()
        .map(|r| to_view(r, authenticated, stale_after))
        .collect();
    Json(list)
}

// GET /nodes/:id (détail)
async fn get_node(
    State(app): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<NodeView>, StatusCode> {
    match app.store.get(&id) {
        Ok(record) => Ok(Json(to_view(
            &record,
            api_key_matches(&headers),
            app.stale_after(),
        ))),
        Err(_) => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

// PUT /nodes/:id/status (transition forcée par l'opérateur)
async fn put_status(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StatusBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(status) = NodeStatus::parse(&body.status) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "error": format!("invalid status: {}", body.status) })),
        );
    };
    match app.store.force_status(&id, status) {
        Ok(record) => {
            if let Err(e) = persist(&app).await {
                return error_response(e);
            }
            (StatusCode::OK, Json(json!({ "ok": true, "status": record.status })))
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct OrderBody {
    order_index: i64,
}

// PUT /nodes/:id/order
async fn put_order(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<OrderBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    match app.store.set_order(&id, body.order_index) {
        Ok(record) => {
            if let Err(e) = persist(&app).await {
                return error_response(e);
            }
            (
                StatusCode::OK,
                Json(json!({ "ok": true, "order_index": record.order_index })),
            )
        }
        Err(e) => error_response(e),
    }
}

// DELETE /nodes/:id (cascade vers l'entrée d'admission)
async fn delete_node(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match app.ingestor.remove_node(&id) {
        Ok(removed) => {
            if let Err(e) = persist(&app).await {
                return error_response(e);
            }
            (StatusCode::OK, Json(json!({ "ok": true, "name": removed.name })))
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct AdmitBody {
    name: String,
}

// POST /admission (admet un client et provisionne son nœud)
async fn post_admission(
    State(app): State<AppState>,
    Json(body): Json<AdmitBody>,
) -> (StatusCode, Json<serde_json::Value>) {
    if body.name.trim().is_empty() {
        return error_response(CoreError::MalformedPayload("missing client name"));
    }
    let (client, record) = app.ingestor.register_client(body.name.trim());
    if let Err(e) = persist(&app).await {
        return error_response(e);
    }
    (
        StatusCode::OK,
        Json(json!({ "ok": true, "name": client.name, "node_id": record.id })),
    )
}

// GET /admission (liste)
async fn get_admission(State(app): State<AppState>) -> Json<Vec<AllowedClient>> {
    Json(app.admission.list())
}

// DELETE /admission/:name (révoque et cascade vers le nœud)
async fn delete_admission(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    match app.ingestor.remove_client(&name) {
        Ok(()) => {
            if let Err(e) = persist(&app).await {
                return error_response(e);
            }
            (StatusCode::OK, Json(json!({ "ok": true })))
        }
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> NodeRecord {
        let mut record = NodeRecord::provisioned(name, 0, OffsetDateTime::now_utc());
        record.ip_address = "203.0.113.7".into();
        record.status = NodeStatus::Running;
        record
    }

    #[test]
    fn test_unauthenticated_view_masks_ip() {
        let view = to_view(&record("edge-1"), false, Duration::seconds(5));
        assert_eq!(view.ip_address, MASKED_IP);
        assert_eq!(view.name, "edge-1");
        assert_eq!(view.status, NodeStatus::Running);
    }

    #[test]
    fn test_authenticated_view_passes_ip_through() {
        let view = to_view(&record("edge-1"), true, Duration::seconds(5));
        assert_eq!(view.ip_address, "203.0.113.7");
    }

    #[test]
    fn test_view_reports_staleness() {
        let mut stale = record("edge-1");
        stale.last_update -= Duration::seconds(30);
        let view = to_view(&stale, true, Duration::seconds(5));
        assert!(view.stale);
        assert!(view.stale_for_seconds >= 30);

        let view = to_view(&record("edge-2"), true, Duration::seconds(5));
        assert!(!view.stale);
    }

    #[test]
    fn test_public_routes() {
        assert!(is_public(&Method::GET, "/health"));
        assert!(is_public(&Method::POST, "/nodes/update"));
        assert!(is_public(&Method::GET, "/nodes"));
        assert!(is_public(&Method::GET, "/nodes/abc123"));

        // actions opérateur : clé exigée
        assert!(!is_public(&Method::PUT, "/nodes/abc123/status"));
        assert!(!is_public(&Method::PUT, "/nodes/abc123/order"));
        assert!(!is_public(&Method::DELETE, "/nodes/abc123"));
        assert!(!is_public(&Method::GET, "/admission"));
        assert!(!is_public(&Method::POST, "/admission"));
        assert!(!is_public(&Method::DELETE, "/admission/edge-1"));
    }
}
