/**
 * INGESTION PIPELINE - Validation et application des updates agents
 *
 * RÔLE :
 * Chemin unique entre un payload agent brut et le registre : validation de
 * l'identité, contrôle d'admission, normalisation des défauts, application.
 * HTTP (POST /nodes/update) et MQTT (update@v1) passent tous deux par ici.
 *
 * FONCTIONNEMENT :
 * - Payload sans id ou sans nom : rejeté avant de toucher le store
 * - Nom absent de la liste d'admission : NotAllowed (403 côté HTTP)
 * - Champs manquants : défauts documentés (zéros, "Unknown", "N/A")
 * - Regroupe aussi les actions opérateur en cascade (admission <-> nœud)
 */

use crate::admission::{AdmissionList, AllowedClient};
use crate::models::{node_id_for, CoreError, NodeRecord, UpdateIn};
use crate::store::NodeStore;
use std::sync::Arc;

pub struct Ingestor {
    store: Arc<NodeStore>,
    admission: Arc<AdmissionList>,
    admission_required: bool,
}

impl Ingestor {
    pub fn new(store: Arc<NodeStore>, admission: Arc<AdmissionList>, admission_required: bool) -> Self {
        Self { store, admission, admission_required }
    }

    /// Valide, contrôle l'admission, applique. Les agents étant best-effort,
    /// tout ce qui passe la validation tolérante est accepté tel quel.
    pub fn apply(&self, payload: UpdateIn) -> Result<NodeRecord, CoreError> {
        let fields = payload.normalize()?;
        if self.admission_required && !self.admission.contains(&fields.name) {
            return Err(CoreError::NotAllowed(fields.name));
        }
        self.store.apply_update(fields)
    }

    /// Action opérateur : admet un client et provisionne son enregistrement
    /// (maintenance, métriques placeholder) en attendant son premier rapport.
    pub fn register_client(&self, name: &str) -> (AllowedClient, NodeRecord) {
        let client = self.admission.add(name);
        let record = self.store.register(name);
        (client, record)
    }

    /// Cascade : supprime le nœud puis son entrée d'admission.
    pub fn remove_node(&self, id: &str) -> Result<NodeRecord, CoreError> {
        let removed = self.store.delete(id)?;
        self.admission.remove(&removed.name);
        Ok(removed)
    }

    /// Cascade inverse : révoque le client puis supprime son nœud.
    pub fn remove_client(&self, name: &str) -> Result<(), CoreError> {
        if !self.admission.remove(name) {
            return Err(CoreError::NotFound(name.to_string()));
        }
        // le nœud peut déjà avoir disparu, la révocation reste valide
        match self.store.delete(&node_id_for(name)) {
            Ok(_) | Err(CoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
