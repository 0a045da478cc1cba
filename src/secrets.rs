//! # Secret Resolution
//!
//! Secret-typed variable set items are stored encrypted. They are revealed
//! only while building a worker's job payload and never written back in clear.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{EngineError, Result};
use crate::models::{VariableSet, VariableSetItem};

#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Clear value of a secret item of a variable set
    async fn reveal(&self, variable_set: &VariableSet, item: &VariableSetItem) -> Result<String>;
}

/// In-memory secret table keyed by `(project, set, item)`
#[derive(Debug, Default)]
pub struct StaticSecretResolver {
    secrets: RwLock<HashMap<(String, String, String), String>>,
}

impl StaticSecretResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, project_key: &str, set_name: &str, item_name: &str, value: &str) {
        self.secrets.write().insert(
            (
                project_key.to_string(),
                set_name.to_string(),
                item_name.to_string(),
            ),
            value.to_string(),
        );
    }
}

#[async_trait]
impl SecretResolver for StaticSecretResolver {
    async fn reveal(&self, variable_set: &VariableSet, item: &VariableSetItem) -> Result<String> {
        let key = (
            variable_set.project_key.clone(),
            variable_set.name.clone(),
            item.name.clone(),
        );
        self.secrets.read().get(&key).cloned().ok_or_else(|| {
            EngineError::not_found("secret", format!("{}/{}", variable_set.name, item.name))
        })
    }
}
