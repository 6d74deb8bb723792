//! Error types for LLANOGAS.

use uuid::Uuid;

use crate::cases::model::CaseState;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// External mailbox errors. All of these are transient from the sync loop's
/// point of view: the tick is abandoned and the next tick tries again.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Mailbox authentication failed: {0}")]
    Auth(String),

    #[error("Mailbox request failed: {0}")]
    Http(String),

    #[error("Mailbox rate limited")]
    RateLimited,

    #[error("Failed to decode message {id}: {reason}")]
    Decode { id: String, reason: String },
}

/// Outbound notification errors. Never propagated past the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Failed to send notification: {0}")]
    SendFailed(String),

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to persist notification: {0}")]
    Store(#[from] DatabaseError),
}

/// Case workflow errors, surfaced to API callers.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("El caso {case_id} está en estado {current}; esta acción requiere {required}.")]
    InvalidState {
        case_id: Uuid,
        current: CaseState,
        required: CaseState,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Error interno: {0}")]
    Internal(String),
}

impl From<DatabaseError> for WorkflowError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound { entity, id } => {
                Self::NotFound(format!("{entity} {id} no encontrado"))
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_message_names_both_states() {
        let err = WorkflowError::InvalidState {
            case_id: Uuid::nil(),
            current: CaseState::Asignado,
            required: CaseState::EnRedaccion,
        };
        assert_eq!(
            err.to_string(),
            format!(
                "El caso {} está en estado ASIGNADO; esta acción requiere EN_REDACCION.",
                Uuid::nil()
            )
        );
    }

    #[test]
    fn database_not_found_maps_to_workflow_not_found() {
        let err: WorkflowError = DatabaseError::NotFound {
            entity: "case".into(),
            id: "abc".into(),
        }
        .into();
        assert!(matches!(err, WorkflowError::NotFound(_)));
    }

    #[test]
    fn database_query_maps_to_internal() {
        let err: WorkflowError = DatabaseError::Query("boom".into()).into();
        assert!(matches!(err, WorkflowError::Internal(_)));
    }
}
