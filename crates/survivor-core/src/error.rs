// Error taxonomy: collaborator failures and the domain errors surfaced to callers.

use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Collaborator errors
// ---------------------------------------------------------------------------

/// Failure reported by a persistence collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend rejected the request: {0}")]
    Rejected(String),
}

// ---------------------------------------------------------------------------
// Domain errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the engines to their callers.
///
/// Clone is required so a single in-flight membership load can hand the same
/// result to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurvivorError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },

    #[error("driver {driver_id} was already picked for race {previous_race_id}")]
    Conflict {
        driver_id: String,
        previous_race_id: String,
    },

    #[error("pick deadline for race {race_id} has passed")]
    DeadlinePassed { race_id: String },

    #[error("transient backend failure: {0}")]
    TransientBackend(String),

    #[error("no eligible driver left in the qualifying order for race {race_id}")]
    NoEligibleDriver { race_id: String },

    #[error("no active league selected")]
    NoActiveContext,

    #[error("authentication required")]
    Unauthenticated,

    #[error("member {user_id} is no longer active in league {league_id}")]
    MemberInactive { league_id: String, user_id: String },

    #[error("lives configuration for league {league_id} is locked")]
    Locked { league_id: String },

    #[error("{0}")]
    Forbidden(String),

    #[error("backend rejected the request: {0}")]
    Rejected(String),

    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },
}

impl SurvivorError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SurvivorError::TransientBackend(_))
    }

    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        SurvivorError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        SurvivorError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<StoreError> for SurvivorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => SurvivorError::NotFound { entity, id },
            StoreError::Unavailable(_) | StoreError::Timeout(_) => {
                SurvivorError::TransientBackend(err.to_string())
            }
            StoreError::Rejected(message) => SurvivorError::Rejected(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(SurvivorError::TransientBackend("down".into()).is_retryable());
        assert!(!SurvivorError::NoActiveContext.is_retryable());
        assert!(!SurvivorError::DeadlinePassed {
            race_id: "monaco".into()
        }
        .is_retryable());
        assert!(!SurvivorError::Conflict {
            driver_id: "44".into(),
            previous_race_id: "bahrain".into()
        }
        .is_retryable());
    }

    #[test]
    fn timeouts_and_outages_map_to_transient() {
        let timeout: SurvivorError = StoreError::Timeout(Duration::from_millis(250)).into();
        assert!(timeout.is_retryable());

        let outage: SurvivorError = StoreError::Unavailable("503".into()).into();
        assert!(matches!(outage, SurvivorError::TransientBackend(ref m) if m.contains("503")));
    }

    #[test]
    fn store_not_found_keeps_entity_and_id() {
        let err: SurvivorError = StoreError::NotFound {
            entity: "league",
            id: "l-9".into(),
        }
        .into();
        assert_eq!(err, SurvivorError::not_found("league", "l-9"));
        assert_eq!(err.to_string(), "league `l-9` not found");
    }
}
