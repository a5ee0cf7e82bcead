use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// Closed interval `[start, end]`. Both endpoints belong to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: Ms,
    pub end: Ms,
}

impl Window {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "Window start must not be after end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Inclusive on both ends.
    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    pub id: Ulid,
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
}

/// The two kinds of access point a place owns. They share one shape and one
/// lifecycle; only the table they live in differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessKind {
    Gate,
    Turnstile,
}

impl AccessKind {
    pub const ALL: [AccessKind; 2] = [AccessKind::Gate, AccessKind::Turnstile];

    pub fn table(&self) -> &'static str {
        match self {
            AccessKind::Gate => "gates",
            AccessKind::Turnstile => "turnstiles",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AccessKind::Gate => "gate",
            AccessKind::Turnstile => "turnstile",
        }
    }
}

/// A gate or turnstile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPoint {
    pub id: Ulid,
    pub place_id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: Ulid,
    pub place_id: Ulid,
    /// Display name, unique across all places.
    pub event: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub email: String,
    pub phone: String,
    pub window: Window,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Live state of one place: its scalar fields plus the events scheduled there.
/// Gates and turnstiles live in the store's child tables, keyed by place.
#[derive(Debug, Clone)]
pub struct PlaceState {
    pub place: Place,
    /// Sorted by `window.start`.
    pub events: Vec<Event>,
}

impl PlaceState {
    pub fn new(place: Place) -> Self {
        Self {
            place,
            events: Vec::new(),
        }
    }

    /// Insert event maintaining sort order by window.start.
    pub fn insert_event(&mut self, event: Event) {
        let pos = self
            .events
            .binary_search_by_key(&event.window.start, |e| e.window.start)
            .unwrap_or_else(|e| e);
        self.events.insert(pos, event);
    }

    pub fn remove_event(&mut self, id: Ulid) -> Option<Event> {
        let pos = self.events.iter().position(|e| e.id == id)?;
        Some(self.events.remove(pos))
    }

    pub fn get_event(&self, id: Ulid) -> Option<&Event> {
        self.events.iter().find(|e| e.id == id)
    }
}

/// One committed mutation. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    PlaceCreated {
        place: Place,
    },
    PlaceUpdated {
        place: Place,
    },
    PlaceDeleted {
        id: Ulid,
    },
    ChildCreated {
        kind: AccessKind,
        child: AccessPoint,
    },
    ChildUpdated {
        kind: AccessKind,
        child: AccessPoint,
        from_place: Ulid,
    },
    ChildrenDeleted {
        kind: AccessKind,
        place_id: Ulid,
        ids: Vec<Ulid>,
    },
    EventCreated {
        event: Event,
    },
    EventUpdated {
        event: Event,
        from_place: Ulid,
    },
    EventDeleted {
        id: Ulid,
        place_id: Ulid,
    },
}

// ── Request payloads ─────────────────────────────────────────────

/// Desired state of one child in a reconciliation request. A record with an
/// id updates that child; a record without one creates a new child.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildInput {
    #[serde(default)]
    pub id: Option<Ulid>,
    #[serde(default)]
    pub name: Option<String>,
}

impl ChildInput {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: Some(name.into()),
        }
    }

    pub fn existing(id: Ulid, name: Option<&str>) -> Self {
        Self {
            id: Some(id),
            name: name.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceDraft {
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub gates: Option<Vec<ChildInput>>,
    pub turnstiles: Option<Vec<ChildInput>>,
}

/// Partial place update. `None` keeps the stored value; a child list that is
/// present replaces the current children through reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacePatch {
    pub name: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub gates: Option<Vec<ChildInput>>,
    pub turnstiles: Option<Vec<ChildInput>>,
}

impl PlacePatch {
    pub fn children(&self, kind: AccessKind) -> Option<&Vec<ChildInput>> {
        match kind {
            AccessKind::Gate => self.gates.as_ref(),
            AccessKind::Turnstile => self.turnstiles.as_ref(),
        }
    }
}

/// Event creation request. Dates are raw text; the admission pipeline parses them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub place_id: Ulid,
    pub event: String,
    pub kind: String,
    pub email: String,
    pub phone: String,
    pub date_start: String,
    pub date_end: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPatch {
    pub place_id: Option<Ulid>,
    pub event: Option<String>,
    pub kind: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub date_start: Option<String>,
    pub date_end: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildPatch {
    pub name: Option<String>,
    pub place_id: Option<Ulid>,
}

/// Raw list parameters: `search` is `field:term`, `order` is `field direction`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub search: Option<String>,
    pub order: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceView {
    pub place: Place,
    pub gates: Vec<AccessPoint>,
    pub turnstiles: Vec<AccessPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventView {
    pub event: Event,
    pub place: Place,
}

/// Paginated envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u32,
}
