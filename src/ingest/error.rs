use crate::database_ops::attribute::AttributeKind;

/// Why one record could not be synced.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A storage call failed while syncing one record; the run goes on.
    #[error("{op} failed for steam_id {steam_id}: {cause:#}")]
    Storage {
        op: &'static str,
        steam_id: i64,
        cause: anyhow::Error,
    },
    /// A name was still unknown after registration. Indicates a sequencing bug.
    #[error("{kind} {name:?} has no id after registration")]
    TranslationGap { kind: AttributeKind, name: String },
}

impl SyncError {
    pub fn storage(op: &'static str, steam_id: i64, cause: anyhow::Error) -> Self {
        SyncError::Storage {
            op,
            steam_id,
            cause,
        }
    }

    pub fn op(&self) -> &'static str {
        match self {
            SyncError::Storage { op, .. } => op,
            SyncError::TranslationGap { .. } => "resolve",
        }
    }

    /// Errors that mean the run itself is wrong, not just this record.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::TranslationGap { .. })
    }
}

/// Result of handing one dequeued record to the consumer.
#[derive(Debug)]
pub enum SyncOutcome {
    Synced { game_id: i64 },
    /// Same `steam_id` already handled this run.
    Duplicate,
    Failed { reason: SyncError },
}

impl SyncOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncOutcome::Synced { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_message_names_operation_and_game() {
        let err = SyncError::storage("upsert_game", 620, anyhow::anyhow!("connection reset"));
        let msg = err.to_string();
        assert!(msg.contains("upsert_game"));
        assert!(msg.contains("620"));
        assert!(msg.contains("connection reset"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn translation_gap_is_fatal() {
        let err = SyncError::TranslationGap {
            kind: AttributeKind::Tag,
            name: "Roguelike".into(),
        };
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "tag \"Roguelike\" has no id after registration");
    }
}
