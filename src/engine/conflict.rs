use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_window(window: &Window) -> Result<(), EngineError> {
    use crate::limits::*;
    if window.start < MIN_VALID_TIMESTAMP_MS || window.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

/// True if the candidate `[start, end]` collides with any existing event.
/// Stops at the first collision.
pub fn overlaps<'a>(existing: impl IntoIterator<Item = &'a Event>, start: Ms, end: Ms) -> bool {
    first_conflict(existing, start, end, None).is_some()
}

/// First existing event whose window collides with `[start, end]`, ignoring
/// the event `skip` (the one being rescheduled, on update).
pub fn first_conflict<'a>(
    existing: impl IntoIterator<Item = &'a Event>,
    start: Ms,
    end: Ms,
    skip: Option<Ulid>,
) -> Option<&'a Event> {
    existing
        .into_iter()
        .filter(|e| Some(e.id) != skip)
        .find(|e| collides(&e.window, start, end))
}

// Four membership tests, all closed. Touching endpoints collide.
fn collides(existing: &Window, start: Ms, end: Ms) -> bool {
    let candidate = Window { start, end };
    existing.contains_instant(start)
        || existing.contains_instant(end)
        || candidate.contains_instant(existing.start)
        || candidate.contains_instant(existing.end)
}
