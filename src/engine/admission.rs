//! Ordered checks an event must pass before it is written.
//!
//! Each check is a function from the previous check's output to its own, so
//! the order below is the only order the code can run them in:
//!
//! 1. [`Check::ParseDates`]   malformed date text      → `InvalidDate`
//! 2. [`Check::NotInPast`]    start strictly before now → `PastStart`
//! 3. [`Check::Ordered`]      start after end           → `InvertedRange`
//! 4. [`Check::PlaceExists`]  parent place missing      → `NotFound`
//! 5. [`Check::NoOverlap`]    window collides at place  → `Conflict(Overlap)`
//! 6. [`Check::UniqueName`]   name used by another event → `Conflict(DuplicateEventName)`

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::limits::MAX_DATE_TEXT_LEN;
use crate::model::*;

use super::conflict::{first_conflict, validate_window};
use super::error::{ConflictReason, Entity};
use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    ParseDates,
    NotInPast,
    Ordered,
    PlaceExists,
    NoOverlap,
    UniqueName,
}

impl Check {
    pub fn label(&self) -> &'static str {
        match self {
            Check::ParseDates => "parse_dates",
            Check::NotInPast => "not_in_past",
            Check::Ordered => "ordered",
            Check::PlaceExists => "place_exists",
            Check::NoOverlap => "no_overlap",
            Check::UniqueName => "unique_name",
        }
    }
}

/// A failed admission: which check stopped it and why.
#[derive(Debug)]
pub struct Rejected {
    pub check: Check,
    pub error: EngineError,
}

impl From<Rejected> for EngineError {
    fn from(r: Rejected) -> Self {
        r.error
    }
}

/// Where a window endpoint comes from on this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateInput<'a> {
    Submitted(&'a str),
    /// Omitted from an update; the stored value stands.
    Stored(Ms),
}

/// Everything the checks look at. The engine builds this while holding the
/// target place's write lock.
pub struct Candidate<'a> {
    /// Set on update, so the event does not collide with itself.
    pub event_id: Option<Ulid>,
    pub name: &'a str,
    pub place_id: Ulid,
    pub place: Option<&'a PlaceState>,
    pub date_start: DateInput<'a>,
    pub date_end: DateInput<'a>,
    pub now: Ms,
}

/// Output of `ParseDates`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedDates {
    pub start: Ms,
    pub end: Ms,
    pub start_submitted: bool,
}

/// Run every check in order. `name_owner` answers which event, if any,
/// currently holds a display name.
pub fn admit(
    c: &Candidate<'_>,
    name_owner: impl Fn(&str) -> Option<Ulid>,
) -> Result<Window, Rejected> {
    let at = |check: Check| move |error: EngineError| Rejected { check, error };

    let parsed = parse_dates(c.date_start, c.date_end).map_err(at(Check::ParseDates))?;
    not_in_past(&parsed, c.now).map_err(at(Check::NotInPast))?;
    let window = ordered(&parsed).map_err(at(Check::Ordered))?;
    let place = place_exists(c.place_id, c.place).map_err(at(Check::PlaceExists))?;
    no_overlap(place, &window, c.event_id).map_err(at(Check::NoOverlap))?;
    unique_name(c.name, c.event_id, name_owner).map_err(at(Check::UniqueName))?;
    Ok(window)
}

pub fn parse_dates(start: DateInput<'_>, end: DateInput<'_>) -> Result<ParsedDates, EngineError> {
    let resolve = |input: DateInput<'_>| match input {
        DateInput::Submitted(raw) => parse_instant(raw),
        DateInput::Stored(ms) => Ok(ms),
    };
    Ok(ParsedDates {
        start: resolve(start)?,
        end: resolve(end)?,
        start_submitted: matches!(start, DateInput::Submitted(_)),
    })
}

/// Only a submitted start is held to "not in the past"; an update that leaves
/// the start alone may touch an event already under way.
pub fn not_in_past(parsed: &ParsedDates, now: Ms) -> Result<(), EngineError> {
    if parsed.start_submitted && parsed.start < now {
        return Err(EngineError::PastStart);
    }
    Ok(())
}

pub fn ordered(parsed: &ParsedDates) -> Result<Window, EngineError> {
    if parsed.start > parsed.end {
        return Err(EngineError::InvertedRange);
    }
    let window = Window::new(parsed.start, parsed.end);
    validate_window(&window)?;
    Ok(window)
}

pub fn place_exists(place_id: Ulid, place: Option<&PlaceState>) -> Result<&PlaceState, EngineError> {
    place.ok_or(EngineError::NotFound(Entity::Place, place_id))
}

pub fn no_overlap(place: &PlaceState, window: &Window, skip: Option<Ulid>) -> Result<(), EngineError> {
    match first_conflict(&place.events, window.start, window.end, skip) {
        Some(existing) => Err(EngineError::Conflict(ConflictReason::Overlap {
            existing: existing.id,
        })),
        None => Ok(()),
    }
}

pub fn unique_name(
    name: &str,
    own_id: Option<Ulid>,
    name_owner: impl Fn(&str) -> Option<Ulid>,
) -> Result<(), EngineError> {
    match name_owner(name) {
        Some(owner) if Some(owner) != own_id => Err(EngineError::Conflict(
            ConflictReason::DuplicateEventName(name.to_string()),
        )),
        _ => Ok(()),
    }
}

/// Accepts RFC 3339, a naive date-time (read as UTC), or a bare date
/// (midnight UTC).
pub fn parse_instant(raw: &str) -> Result<Ms, EngineError> {
    let s = raw.trim();
    let invalid = || EngineError::InvalidDate(raw.chars().take(MAX_DATE_TEXT_LEN).collect());
    if s.is_empty() || s.len() > MAX_DATE_TEXT_LEN {
        return Err(invalid());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(ndt.and_utc().timestamp_millis());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|ndt| ndt.and_utc().timestamp_millis())
        .ok_or_else(invalid)
}
