//! Audit trail entries
//!
//! Gateways and the executor emit [`AuditEntry`] values without knowing who
//! they belong to. The executor stamps them with an [`AuditStamp`] before they
//! are persisted, so every record of one execution attempt shares the same
//! correlation id.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::entities::order::string_enum;

const CORRELATION_ID_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditType {
    OrderRequested,
    OrderFilled,
    OrderRejected,
    ExecutionFailed,
    PositionOpened,
    PositionExpanded,
    PositionClosed,
    PositionAlreadyOpen,
    NoOpenPosition,
    OrderNotFound,
    BotNotFound,
    BotDisabled,
    ProviderNotFound,
    LockContention,
    MarginTypeChanged,
    LedgerFailure,
}

string_enum!(AuditType {
    OrderRequested => "order_requested",
    OrderFilled => "order_filled",
    OrderRejected => "order_rejected",
    ExecutionFailed => "execution_failed",
    PositionOpened => "position_opened",
    PositionExpanded => "position_expanded",
    PositionClosed => "position_closed",
    PositionAlreadyOpen => "position_already_open",
    NoOpenPosition => "no_open_position",
    OrderNotFound => "order_not_found",
    BotNotFound => "bot_not_found",
    BotDisabled => "bot_disabled",
    ProviderNotFound => "provider_not_found",
    LockContention => "lock_contention",
    MarginTypeChanged => "margin_type_changed",
    LedgerFailure => "ledger_failure",
});

/// An unattributed audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub kind: AuditType,
    pub description: String,
    pub data: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(kind: AuditType, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Identity attached to every audit record of one execution attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AuditStamp {
    pub user_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub target_id: Option<Uuid>,
    pub correlation_id: String,
}

impl AuditStamp {
    pub fn new(correlation_id: String) -> Self {
        Self {
            user_id: None,
            actor_id: None,
            target_id: None,
            correlation_id,
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn target(mut self, target_id: Uuid) -> Self {
        self.target_id = Some(target_id);
        self
    }

    pub fn stamp(&self, entry: AuditEntry) -> AuditRecord {
        AuditRecord {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            actor_id: self.actor_id,
            target_id: self.target_id,
            correlation_id: self.correlation_id.clone(),
            kind: entry.kind,
            description: entry.description,
            data: entry.data,
            created_at: Utc::now(),
        }
    }

    pub fn stamp_all(&self, entries: impl IntoIterator<Item = AuditEntry>) -> Vec<AuditRecord> {
        entries.into_iter().map(|entry| self.stamp(entry)).collect()
    }
}

/// Persisted, append-only audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub target_id: Option<Uuid>,
    pub correlation_id: String,
    pub kind: AuditType,
    pub description: String,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Fresh correlation id for one execution attempt
pub fn new_correlation_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CORRELATION_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_id_shape() {
        let id = new_correlation_id();
        assert_eq!(id.len(), 15);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, new_correlation_id());
    }

    #[test]
    fn test_stamp_threads_identity() {
        let user = Uuid::new_v4();
        let bot = Uuid::new_v4();
        let order = Uuid::new_v4();
        let stamp = AuditStamp::new("abc".to_string())
            .user(user)
            .actor(bot)
            .target(order);

        let records = stamp.stamp_all(vec![
            AuditEntry::new(AuditType::OrderRequested, "requested"),
            AuditEntry::new(AuditType::OrderFilled, "filled")
                .with_data(serde_json::json!({ "price": "101" })),
        ]);

        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.user_id, Some(user));
            assert_eq!(record.actor_id, Some(bot));
            assert_eq!(record.target_id, Some(order));
            assert_eq!(record.correlation_id, "abc");
        }
        assert_eq!(records[1].data, Some(serde_json::json!({ "price": "101" })));
        assert_ne!(records[0].id, records[1].id);
    }
}
