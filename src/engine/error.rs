use ulid::Ulid;

use crate::model::AccessKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Place,
    Gate,
    Turnstile,
    Event,
}

impl From<AccessKind> for Entity {
    fn from(kind: AccessKind) -> Self {
        match kind {
            AccessKind::Gate => Entity::Gate,
            AccessKind::Turnstile => Entity::Turnstile,
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Entity::Place => "place",
            Entity::Gate => "gate",
            Entity::Turnstile => "turnstile",
            Entity::Event => "event",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    DuplicatePlaceName(String),
    DuplicateEventName(String),
    Overlap { existing: Ulid },
    PlaceHasEvents(Ulid),
}

#[derive(Debug)]
pub enum EngineError {
    InvalidInput(String),
    InvalidDate(String),
    PastStart,
    InvertedRange,
    NotFound(Entity, Ulid),
    Conflict(ConflictReason),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to wire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "22023",
            EngineError::InvalidDate(_) => "22007",
            EngineError::PastStart => "22008",
            EngineError::InvertedRange => "22000",
            EngineError::NotFound(..) => "P0002",
            EngineError::Conflict(ConflictReason::DuplicatePlaceName(_))
            | EngineError::Conflict(ConflictReason::DuplicateEventName(_)) => "23505",
            EngineError::Conflict(ConflictReason::Overlap { .. }) => "23P01",
            EngineError::Conflict(ConflictReason::PlaceHasEvents(_)) => "23503",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::InvalidDate(_) => "invalid_date",
            EngineError::PastStart => "past_start",
            EngineError::InvertedRange => "inverted_range",
            EngineError::NotFound(..) => "not_found",
            EngineError::Conflict(ConflictReason::DuplicatePlaceName(_)) => "duplicate_place_name",
            EngineError::Conflict(ConflictReason::DuplicateEventName(_)) => "duplicate_event_name",
            EngineError::Conflict(ConflictReason::Overlap { .. }) => "overlap",
            EngineError::Conflict(ConflictReason::PlaceHasEvents(_)) => "place_has_events",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::InvalidDate(raw) => write!(f, "invalid date: {raw:?}"),
            EngineError::PastStart => write!(f, "event date cannot be in the past"),
            EngineError::InvertedRange => {
                write!(f, "start date must not be after end date")
            }
            EngineError::NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            EngineError::Conflict(reason) => match reason {
                ConflictReason::DuplicatePlaceName(_) => {
                    write!(f, "a place with this name already exists")
                }
                ConflictReason::DuplicateEventName(_) => write!(f, "event name must be unique"),
                ConflictReason::Overlap { existing } => write!(
                    f,
                    "an event already exists in this time window (conflicts with {existing})"
                ),
                ConflictReason::PlaceHasEvents(_) => {
                    write!(f, "an event exists at this place, cannot delete")
                }
            },
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_map_to_distinct_sqlstates() {
        let overlap = EngineError::Conflict(ConflictReason::Overlap { existing: Ulid::new() });
        let dup = EngineError::Conflict(ConflictReason::DuplicateEventName("Concert".into()));
        let busy = EngineError::Conflict(ConflictReason::PlaceHasEvents(Ulid::new()));
        assert_eq!(overlap.sqlstate(), "23P01");
        assert_eq!(dup.sqlstate(), "23505");
        assert_eq!(busy.sqlstate(), "23503");
    }

    #[test]
    fn messages_are_distinct_for_overlap_and_duplicate_name() {
        let overlap = EngineError::Conflict(ConflictReason::Overlap { existing: Ulid::new() });
        let dup = EngineError::Conflict(ConflictReason::DuplicateEventName("Concert".into()));
        assert_ne!(overlap.to_string(), dup.to_string());
        assert!(overlap.to_string().contains("time window"));
    }

    #[test]
    fn not_found_names_the_entity() {
        let id = Ulid::new();
        let e = EngineError::NotFound(AccessKind::Turnstile.into(), id);
        assert_eq!(e.to_string(), format!("turnstile not found: {id}"));
        assert_eq!(e.sqlstate(), "P0002");
    }

    #[test]
    fn place_delete_message() {
        let e = EngineError::Conflict(ConflictReason::PlaceHasEvents(Ulid::new()));
        assert_eq!(e.to_string(), "an event exists at this place, cannot delete");
    }
}
