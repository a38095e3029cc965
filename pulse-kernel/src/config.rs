use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// Configuration du kernel, chargée depuis kernel.yaml (chemin surchargé par
/// PULSE_KERNEL_CONFIG). Tous les champs ont un défaut : un fichier partiel
/// ou absent donne un kernel fonctionnel.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    /// Seuil de silence T : un nœud running muet plus de T secondes est
    /// rétrogradé stopped par le sweeper.
    pub stale_after_secs: u64,
    /// Période P du sweeper. P <= T/2 borne la latence de détection.
    pub sweep_interval_secs: u64,
    /// Si faux, un update d'un nom inconnu crée son enregistrement.
    pub admission_required: bool,
    pub http_port: u16,
    pub data_dir: String,
    /// `mqtt: null` dans le yaml désactive le canal push.
    pub mqtt: Option<MqttConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 5,
            sweep_interval_secs: 2,
            admission_required: true,
            http_port: 8080,
            data_dir: "./data".into(),
            mqtt: Some(MqttConf { host: "localhost".into(), port: 1883 }),
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("PULSE_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt)
    } else {
        eprintln!("[kernel] pas de kernel.yaml, usage config par défaut");
        KernelConfig::default()
    };

    // T et P se surchargent aussi par l'environnement
    if let Some(secs) = env_secs("PULSE_STALE_AFTER_SECS") {
        cfg.stale_after_secs = secs;
    }
    if let Some(secs) = env_secs("PULSE_SWEEP_INTERVAL_SECS") {
        cfg.sweep_interval_secs = secs;
    }
    cfg
}

fn parse_config(txt: &str) -> KernelConfig {
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        eprintln!("[kernel] config invalide: {e}");
        KernelConfig::default()
    })
}

fn env_secs(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}
