use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableSetItemType {
    String,
    /// Value is stored encrypted and revealed only inside a job payload
    Secret,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSetItem {
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: VariableSetItemType,
    pub value: String,
}

/// Project-scoped named set of variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableSet {
    pub id: Uuid,
    pub project_key: String,
    pub name: String,
    pub items: Vec<VariableSetItem>,
}

impl VariableSet {
    pub fn new(project_key: &str, name: &str, items: Vec<VariableSetItem>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_key: project_key.to_string(),
            name: name.to_string(),
            items,
        }
    }
}
