use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

// Sentinelles renvoyées quand un agent n'a pas fourni le champ
pub const UNKNOWN: &str = "Unknown";
pub const NOT_AVAILABLE: &str = "N/A";
pub const UNKNOWN_LOCATION: &str = "UN";

/// Statut de vivacité d'un nœud, sérialisé en minuscules (format wire historique).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Stopped,
    Maintenance,
}

impl NodeStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "stopped" => Some(Self::Stopped),
            "maintenance" => Some(Self::Maintenance),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Maintenance => "maintenance",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Télémétrie telle que rapportée par le collecteur : copiée telle quelle
/// dans l'enregistrement, jamais interprétée par le kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub cpu: f32,
    pub memory: f32,
    pub disk: f32,
    pub network_in: f64,
    pub network_out: f64,
    pub uptime: u64,
    pub total_memory: f64,
    pub total_disk: f64,
    pub os_type: String,
    pub cpu_info: String,
    #[serde(rename = "type")]
    pub node_type: String, // VPS, Dedicated Server...
    pub location: String, // code pays à deux lettres
}

impl Default for NodeMetrics {
    fn default() -> Self {
        Self {
            cpu: 0.0,
            memory: 0.0,
            disk: 0.0,
            network_in: 0.0,
            network_out: 0.0,
            uptime: 0,
            total_memory: 0.0,
            total_disk: 0.0,
            os_type: UNKNOWN.to_string(),
            cpu_info: NOT_AVAILABLE.to_string(),
            node_type: UNKNOWN.to_string(),
            location: UNKNOWN_LOCATION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub status: NodeStatus,
    pub ip_address: String,
    pub metrics: NodeMetrics,
    pub order_index: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    /// Vrai entre l'enregistrement opérateur et le premier update accepté
    /// (ou le premier statut forcé) : la maintenance initiale n'est pas
    /// encore la maintenance collante déclarée par l'opérateur.
    #[serde(default)]
    pub provisional: bool,
}

impl NodeRecord {
    /// Enregistrement placeholder créé à l'admission d'un client.
    pub fn provisioned(name: &str, order_index: i64, now: OffsetDateTime) -> Self {
        Self {
            id: node_id_for(name),
            name: name.to_string(),
            status: NodeStatus::Maintenance,
            ip_address: UNKNOWN.to_string(),
            metrics: NodeMetrics::default(),
            order_index,
            first_seen: now,
            last_update: now,
            provisional: true,
        }
    }
}

/// Identifiant stable d'un nœud : SHA-256 du nom, tronqué à 32 hex.
/// Dérivé côté kernel, jamais repris du payload.
pub fn node_id_for(name: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(name.as_bytes()));
    digest[..32].to_string()
}

/// Payload d'update tel que poussé par les agents (HTTP ou MQTT).
/// Tout est optionnel hors identité : les agents sont best-effort.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateIn {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    pub location: Option<String>,
    pub ip_address: Option<String>,
    pub uptime: Option<u64>,
    pub network_in: Option<f64>,
    pub network_out: Option<f64>,
    pub cpu: Option<f32>,
    pub memory: Option<f32>,
    pub disk: Option<f32>,
    pub os_type: Option<String>,
    pub cpu_info: Option<String>,
    pub total_memory: Option<f64>,
    pub total_disk: Option<f64>,
}

impl UpdateIn {
    /// Valide l'identité puis matérialise chaque défaut documenté.
    /// L'id du payload n'est exigé que présent : l'id canonique dérive du nom.
    pub fn normalize(self) -> Result<NodeFields, CoreError> {
        if self.id.as_deref().map_or(true, |s| s.trim().is_empty()) {
            return Err(CoreError::MalformedPayload("missing node identity"));
        }
        let name = match self.name {
            Some(n) if !n.trim().is_empty() => n,
            _ => return Err(CoreError::MalformedPayload("missing display name")),
        };
        Ok(NodeFields {
            name,
            ip_address: self.ip_address.unwrap_or_else(|| UNKNOWN.to_string()),
            metrics: NodeMetrics {
                cpu: self.cpu.unwrap_or(0.0),
                memory: self.memory.unwrap_or(0.0),
                disk: self.disk.unwrap_or(0.0),
                network_in: self.network_in.unwrap_or(0.0),
                network_out: self.network_out.unwrap_or(0.0),
                uptime: self.uptime.unwrap_or(0),
                total_memory: self.total_memory.unwrap_or(0.0),
                total_disk: self.total_disk.unwrap_or(0.0),
                os_type: self.os_type.unwrap_or_else(|| UNKNOWN.to_string()),
                cpu_info: self.cpu_info.unwrap_or_else(|| NOT_AVAILABLE.to_string()),
                node_type: self.node_type.unwrap_or_else(|| UNKNOWN.to_string()),
                location: self.location.unwrap_or_else(|| UNKNOWN_LOCATION.to_string()),
            },
        })
    }
}

/// Forme normalisée d'un update accepté : chaque champ optionnel du wire
/// a reçu son défaut, plus rien n'est implicite en aval.
#[derive(Debug, Clone)]
pub struct NodeFields {
    pub name: String,
    pub ip_address: String,
    pub metrics: NodeMetrics,
}

/// Erreurs du cœur, mappées telles quelles par les surfaces HTTP/MQTT.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("client not allowed: {0}")]
    NotAllowed(String),
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(&'static str),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}
