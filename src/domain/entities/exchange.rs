use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::entities::order::string_enum;

/// A user's exchange account, bound to one gateway provider
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub id: Uuid,
    pub user_id: Uuid,
    pub label: String,
    pub provider_key: String,
    /// JSON list of `{ "property": ..., "value": ... }` entries
    pub properties: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginType {
    Isolated,
    Cross,
}

string_enum!(MarginType {
    Isolated => "isolated",
    Cross => "cross",
});
