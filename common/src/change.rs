use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// A single field-level difference between the last applied deployment and
/// this one. The union of changes is attached to the deployment so the
/// side-effectful diffing activities (volume deletion, URL unexposing)
/// never have to re-derive what changed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeploymentChange {
    pub field: ChangeField,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    /// Identifies the changed item for list-valued fields.
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub new_value: Option<Value>,
    #[serde(default)]
    pub old_value: Option<Value>,
}

impl DeploymentChange {
    pub fn is_volume_deletion(&self) -> bool {
        self.field == ChangeField::Volumes && self.change_type == ChangeType::Delete
    }
}

#[derive(
    sqlx::Type, Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[sqlx(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[serde(rename_all = "snake_case")]
pub enum ChangeField {
    Image,
    Command,
    EnvVariables,
    Volumes,
    Ports,
    Urls,
    Healthcheck,
    ResourceLimits,
}

#[derive(
    sqlx::Type, Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Add,
    Update,
    Delete,
}
