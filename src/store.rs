use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::database::Database;
use crate::engine::LlmEngine;

/// Settings key the selected model id lives under.
const SELECTED_MODEL_KEY: &str = "selected_model";

/// The single persisted "selected model" setting. The stored value is always
/// a bare id (filename minus extension); older installs wrote filesystem
/// paths or colon-qualified registry names, which are cleaned up the first
/// time they are read.
#[derive(Clone)]
pub struct ModelStore {
    db: Arc<Database>,
}

impl ModelStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Currently selected id, or None when nothing usable is stored.
    ///
    /// Migration-on-read: a path value is normalized to its bare id and the
    /// row rewritten; a colon-qualified value cannot be mapped to a file, so
    /// it is discarded and the caller sees "nothing selected".
    pub fn get(&self) -> Option<String> {
        let raw = match self.db.get_setting(SELECTED_MODEL_KEY) {
            Ok(value) => value?,
            Err(e) => {
                log::warn!("[store] failed to read selected model: {e}");
                return None;
            }
        };

        if raw.contains('/') || raw.contains('\\') {
            let id = bare_id(&raw);
            if id.is_empty() {
                let _ = self.db.delete_setting(SELECTED_MODEL_KEY);
                return None;
            }
            log::info!("[store] migrating stored path to id {id}");
            if let Err(e) = self.db.set_setting(SELECTED_MODEL_KEY, &id) {
                log::warn!("[store] failed to rewrite selected model: {e}");
            }
            return Some(id);
        }

        if raw.contains(':') {
            log::info!("[store] discarding legacy selected model {raw}");
            let _ = self.db.delete_setting(SELECTED_MODEL_KEY);
            return None;
        }

        if raw.is_empty() {
            None
        } else {
            Some(raw)
        }
    }

    pub fn set(&self, id: &str) -> Result<(), String> {
        self.db
            .set_setting(SELECTED_MODEL_KEY, id)
            .map_err(|e| e.to_string())
    }

    pub fn clear(&self) -> Result<(), String> {
        self.db
            .delete_setting(SELECTED_MODEL_KEY)
            .map_err(|e| e.to_string())
    }

    /// Path of the selected model's file, when one is both selected and still
    /// on disk.
    pub fn selected_path(&self, engine: &dyn LlmEngine) -> Option<PathBuf> {
        let id = self.get()?;
        engine.resolve(&id)
    }
}

/// Last path component with its extension removed, handling both separator
/// styles since stored values may predate a platform move.
fn bare_id(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or(raw);
    Path::new(base)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string()
}
