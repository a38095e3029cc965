use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// Poignée exclusive sur un enregistrement : les writers d'un même id se
/// sérialisent dessus, les autres ids restent libres.
pub type Shared<T> = Arc<Mutex<T>>;

/// Table à verrou grossier pour les maps lues massivement.
pub type SharedTable<T> = RwLock<T>;

pub fn new_shared<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
