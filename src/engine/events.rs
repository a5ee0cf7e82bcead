use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::ADMISSION_REJECTIONS_TOTAL;

use super::admission::{admit, Candidate, DateInput, Rejected};
use super::conflict::now_ms;
use super::error::{ConflictReason, Entity};
use super::listing::{paginate, EventField, Params};
use super::{Engine, EngineError};

fn rejected(r: Rejected) -> EngineError {
    metrics::counter!(ADMISSION_REJECTIONS_TOTAL, "check" => r.check.label()).increment(1);
    debug!(check = r.check.label(), error = %r.error, "event rejected");
    r.error
}

fn check_event_fields(
    event: Option<&str>,
    kind: Option<&str>,
    email: Option<&str>,
    phone: Option<&str>,
) -> Result<(), EngineError> {
    if let Some(name) = event {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidInput("event name must not be empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("event name too long"));
        }
    }
    for v in [kind, email, phone].into_iter().flatten() {
        if v.len() > MAX_TEXT_LEN {
            return Err(EngineError::LimitExceeded("event field too long"));
        }
    }
    Ok(())
}

impl Engine {
    /// Admit and persist a new event. The target place stays write-locked from
    /// the overlap check through the WAL write.
    pub async fn create_event(&self, draft: EventDraft) -> Result<Event, EngineError> {
        info!(place = %draft.place_id, name = %draft.event, "creating event");
        check_event_fields(
            Some(&draft.event),
            Some(&draft.kind),
            Some(&draft.email),
            Some(&draft.phone),
        )?;
        let now = now_ms();
        let guard = self.lock_place(draft.place_id).await.ok();

        let window = admit(
            &Candidate {
                event_id: None,
                name: &draft.event,
                place_id: draft.place_id,
                place: guard.as_deref(),
                date_start: DateInput::Submitted(&draft.date_start),
                date_end: DateInput::Submitted(&draft.date_end),
                now,
            },
            |name| self.event_names.owner(name),
        )
        .map_err(rejected)?;
        let mut guard = guard.ok_or(EngineError::NotFound(Entity::Place, draft.place_id))?;

        let event = Event {
            id: Ulid::new(),
            place_id: draft.place_id,
            event: draft.event,
            kind: draft.kind,
            email: draft.email,
            phone: draft.phone,
            window,
            created_at: now,
            updated_at: now,
        };
        if self.event_names.reserve(&event.event, event.id).is_err() {
            return Err(EngineError::Conflict(ConflictReason::DuplicateEventName(event.event)));
        }
        let change = Change::EventCreated {
            event: event.clone(),
        };
        if let Err(e) = self.persist_and_apply(&mut [&mut *guard], &change).await {
            warn!(event = %event.id, error = %e, "event create failed");
            self.event_names.release(&event.event, event.id);
            return Err(e);
        }
        debug!(event = %event.id, duration_ms = event.window.duration_ms(), "event admitted");
        Ok(event)
    }

    /// Merge the patch over the stored event, then run the full admission
    /// pipeline on the result. Moving to another place locks both places.
    pub async fn update_event(&self, id: Ulid, patch: EventPatch) -> Result<Event, EngineError> {
        info!(event = %id, "updating event");
        check_event_fields(
            patch.event.as_deref(),
            patch.kind.as_deref(),
            patch.email.as_deref(),
            patch.phone.as_deref(),
        )?;
        let now = now_ms();

        loop {
            let from = self
                .get_place_for_event(&id)
                .ok_or(EngineError::NotFound(Entity::Event, id))?;
            let target = patch.place_id.unwrap_or(from);
            let (from_guard, target_guard) = self.lock_pair(from, target).await;
            let Some(mut from_guard) = from_guard else {
                continue;
            };
            let Some(existing) = from_guard.get_event(id).cloned() else {
                // Moved or deleted while we waited.
                continue;
            };

            let name = patch.event.clone().unwrap_or_else(|| existing.event.clone());
            let target_state = if target == from {
                Some(&*from_guard)
            } else {
                target_guard.as_deref()
            };
            let window = admit(
                &Candidate {
                    event_id: Some(id),
                    name: &name,
                    place_id: target,
                    place: target_state,
                    date_start: patch
                        .date_start
                        .as_deref()
                        .map_or(DateInput::Stored(existing.window.start), DateInput::Submitted),
                    date_end: patch
                        .date_end
                        .as_deref()
                        .map_or(DateInput::Stored(existing.window.end), DateInput::Submitted),
                    now,
                },
                |n| self.event_names.owner(n),
            )
            .map_err(rejected)?;

            let renamed = name != existing.event;
            if renamed && self.event_names.reserve(&name, id).is_err() {
                return Err(EngineError::Conflict(ConflictReason::DuplicateEventName(name)));
            }
            let event = Event {
                id,
                place_id: target,
                event: name,
                kind: patch.kind.clone().unwrap_or(existing.kind),
                email: patch.email.clone().unwrap_or(existing.email),
                phone: patch.phone.clone().unwrap_or(existing.phone),
                window,
                created_at: existing.created_at,
                updated_at: now,
            };
            let change = Change::EventUpdated {
                event: event.clone(),
                from_place: from,
            };
            let result = match target_guard {
                Some(mut tg) if target != from => {
                    self.persist_and_apply(&mut [&mut *from_guard, &mut *tg], &change).await
                }
                _ => self.persist_and_apply(&mut [&mut *from_guard], &change).await,
            };
            if let Err(e) = result {
                if renamed {
                    self.event_names.release(&event.event, id);
                }
                return Err(e);
            }
            return Ok(event);
        }
    }

    pub async fn delete_event(&self, id: Ulid) -> Result<Event, EngineError> {
        info!(event = %id, "deleting event");
        let (place_id, mut guard) = self.resolve_event_write(id).await?;
        let event = guard
            .get_event(id)
            .cloned()
            .ok_or(EngineError::NotFound(Entity::Event, id))?;
        self.persist_and_apply(&mut [&mut *guard], &Change::EventDeleted { id, place_id })
            .await?;
        Ok(event)
    }

    /// The event with its place embedded.
    pub async fn find_event(&self, id: Ulid) -> Result<EventView, EngineError> {
        debug!(event = %id, "finding event");
        loop {
            let place_id = self
                .get_place_for_event(&id)
                .ok_or(EngineError::NotFound(Entity::Event, id))?;
            let Ok(guard) = self.read_place(place_id).await else {
                continue;
            };
            if let Some(event) = guard.get_event(id) {
                return Ok(EventView {
                    event: event.clone(),
                    place: guard.place.clone(),
                });
            }
        }
    }

    pub async fn list_events(
        &self,
        place_id: Option<Ulid>,
        query: &ListQuery,
    ) -> Result<Page<Event>, EngineError> {
        debug!(?place_id, ?query, "listing events");
        let params = Params::parse(query, EventField::Event, DEFAULT_EVENT_PAGE_LIMIT)?;
        let ids: Vec<Ulid> = match place_id {
            Some(pid) => vec![pid],
            None => self.places.iter().map(|e| *e.key()).collect(),
        };
        let mut events = Vec::new();
        for pid in ids {
            if let Ok(guard) = self.read_place(pid).await {
                events.extend(guard.events.iter().cloned());
            }
        }
        Ok(paginate(events, &params))
    }
}
