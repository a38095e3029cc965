use crate::models::CoreError;
use crate::state::SharedTable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowedClient {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Liste des noms autorisés à alimenter le registre.
/// Verrou grossier : un contains par update entrant, écritures opérateur rares.
pub struct AdmissionList {
    clients: SharedTable<HashMap<String, AllowedClient>>,
    data_file: PathBuf,
}

impl AdmissionList {
    pub fn new<P: AsRef<Path>>(data_file: P) -> Self {
        Self {
            clients: SharedTable::new(HashMap::new()),
            data_file: data_file.as_ref().to_path_buf(),
        }
    }

    pub async fn load(&self) -> Result<usize, CoreError> {
        if !self.data_file.exists() {
            println!("[admission] no existing clients file, starting fresh");
            return Ok(0);
        }
        let content = tokio::fs::read_to_string(&self.data_file).await?;
        let clients: HashMap<String, AllowedClient> = serde_json::from_str(&content)?;
        let count = clients.len();
        *self.clients.write() = clients;
        println!("[admission] loaded {} allowed clients from {}", count, self.data_file.display());
        Ok(count)
    }

    pub async fn save(&self) -> Result<(), CoreError> {
        let snapshot = self.clients.read().clone();
        let content = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(&self.data_file, content).await?;
        Ok(())
    }

    /// Admet un nom. Idempotent : ré-admettre renvoie l'entrée existante.
    pub fn add(&self, name: &str) -> AllowedClient {
        let mut clients = self.clients.write();
        if let Some(existing) = clients.get(name) {
            return existing.clone();
        }
        let client = AllowedClient {
            name: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        clients.insert(name.to_string(), client.clone());
        println!("[admission] allowed client {}", name);
        client
    }

    pub fn contains(&self, name: &str) -> bool {
        self.clients.read().contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = self.clients.write().remove(name).is_some();
        if removed {
            println!("[admission] removed client {}", name);
        }
        removed
    }

    pub fn list(&self) -> Vec<AllowedClient> {
        let mut clients: Vec<AllowedClient> = self.clients.read().values().cloned().collect();
        clients.sort_by(|a, b| a.name.cmp(&b.name));
        clients
    }
}
