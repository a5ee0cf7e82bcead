use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::{ConflictReason, Entity};
use super::listing::{paginate, Params, PlaceField};
use super::reconcile::{plan, reconcile, EngineChildren, ReconcileOutcome};
use super::{Engine, EngineError};

fn check_text(field: &'static str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(field));
    }
    Ok(())
}

fn check_place_fields(
    name: Option<&str>,
    address: Option<&str>,
    city: Option<&str>,
    state: Option<&str>,
) -> Result<(), EngineError> {
    if let Some(name) = name {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidInput("place name must not be empty".into()));
        }
        check_text("place name too long", name, MAX_NAME_LEN)?;
    }
    for (label, value) in [
        ("address too long", address),
        ("city too long", city),
        ("state too long", state),
    ] {
        if let Some(v) = value {
            check_text(label, v, MAX_TEXT_LEN)?;
        }
    }
    Ok(())
}

impl Engine {
    pub(super) fn place_view(&self, place: &Place) -> PlaceView {
        PlaceView {
            place: place.clone(),
            gates: self.gates.list_by_place(&place.id),
            turnstiles: self.turnstiles.list_by_place(&place.id),
        }
    }

    /// Create a place, then its gates and turnstiles. Ids on submitted
    /// children are ignored; every record becomes a new child.
    pub async fn create_place(&self, draft: PlaceDraft) -> Result<PlaceView, EngineError> {
        info!(name = %draft.name, "creating place");
        check_place_fields(
            Some(&draft.name),
            Some(&draft.address),
            Some(&draft.city),
            Some(&draft.state),
        )?;

        let mut children = Vec::new();
        for kind in AccessKind::ALL {
            let list = match kind {
                AccessKind::Gate => &draft.gates,
                AccessKind::Turnstile => &draft.turnstiles,
            };
            if let Some(list) = list {
                let fresh: Vec<ChildInput> = list
                    .iter()
                    .map(|c| ChildInput {
                        id: None,
                        name: c.name.clone(),
                    })
                    .collect();
                plan(kind.into(), &[], &fresh)?;
                children.push((kind, fresh));
            }
        }

        let place = Place {
            id: Ulid::new(),
            name: draft.name,
            address: draft.address,
            city: draft.city,
            state: draft.state,
        };
        if self.place_names.reserve(&place.name, place.id).is_err() {
            return Err(EngineError::Conflict(ConflictReason::DuplicatePlaceName(place.name)));
        }
        let created = Change::PlaceCreated {
            place: place.clone(),
        };
        if let Err(e) = self.persist_and_apply(&mut [], &created).await {
            self.place_names.release(&place.name, place.id);
            return Err(e);
        }

        let guard = self.lock_place(place.id).await?;
        for (kind, list) in &children {
            let out = reconcile(&EngineChildren::new(self, *kind), place.id, list).await?;
            debug!(place = %place.id, kind = kind.label(), created = out.created.len(), "children created");
        }
        Ok(self.place_view(&guard.place))
    }

    /// Rename-check, reconcile any submitted child lists, then apply scalar
    /// fields. Omitted fields keep their stored value.
    pub async fn update_place(&self, id: Ulid, patch: PlacePatch) -> Result<PlaceView, EngineError> {
        info!(place = %id, "updating place");
        check_place_fields(
            patch.name.as_deref(),
            patch.address.as_deref(),
            patch.city.as_deref(),
            patch.state.as_deref(),
        )?;
        let mut guard = self.lock_place(id).await?;

        // Validate every list before touching either.
        for kind in AccessKind::ALL {
            if let Some(list) = patch.children(kind) {
                plan(kind.into(), &self.table(kind).list_by_place(&id), list)?;
            }
        }

        let renamed = patch
            .name
            .as_ref()
            .filter(|n| **n != guard.place.name)
            .cloned();
        if let Some(name) = &renamed
            && self.place_names.reserve(name, id).is_err()
        {
            return Err(EngineError::Conflict(ConflictReason::DuplicatePlaceName(name.clone())));
        }

        let result: Result<(), EngineError> = async {
            for kind in AccessKind::ALL {
                if let Some(list) = patch.children(kind) {
                    let ReconcileOutcome { deleted, updated, created } =
                        reconcile(&EngineChildren::new(self, kind), id, list).await?;
                    debug!(
                        place = %id,
                        kind = kind.label(),
                        deleted = deleted.len(),
                        updated = updated.len(),
                        created = created.len(),
                        "children reconciled"
                    );
                }
            }

            let current = &guard.place;
            let place = Place {
                id,
                name: renamed.clone().unwrap_or_else(|| current.name.clone()),
                address: patch.address.clone().unwrap_or_else(|| current.address.clone()),
                city: patch.city.clone().unwrap_or_else(|| current.city.clone()),
                state: patch.state.clone().unwrap_or_else(|| current.state.clone()),
            };
            if place != *current {
                self.persist_and_apply(&mut [&mut *guard], &Change::PlaceUpdated { place })
                    .await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            if let Some(name) = &renamed
                && guard.place.name != *name
            {
                self.place_names.release(name, id);
            }
            return Err(e);
        }
        Ok(self.place_view(&guard.place))
    }

    /// Refused while any event is scheduled at the place. Otherwise removes
    /// gates, then turnstiles, then the place, and returns what was removed.
    pub async fn delete_place(&self, id: Ulid) -> Result<PlaceView, EngineError> {
        info!(place = %id, "deleting place");
        let mut guard = self.lock_place(id).await?;
        if !guard.events.is_empty() {
            return Err(EngineError::Conflict(ConflictReason::PlaceHasEvents(id)));
        }
        let view = self.place_view(&guard.place);

        for (kind, children) in [
            (AccessKind::Gate, &view.gates),
            (AccessKind::Turnstile, &view.turnstiles),
        ] {
            if children.is_empty() {
                continue;
            }
            let change = Change::ChildrenDeleted {
                kind,
                place_id: id,
                ids: children.iter().map(|c| c.id).collect(),
            };
            self.persist_and_apply(&mut [], &change).await?;
        }
        self.persist_and_apply(&mut [&mut *guard], &Change::PlaceDeleted { id })
            .await?;
        Ok(view)
    }

    pub async fn find_place(&self, id: Ulid) -> Result<PlaceView, EngineError> {
        debug!(place = %id, "finding place");
        let guard = self.read_place(id).await?;
        Ok(self.place_view(&guard.place))
    }

    pub async fn list_places(&self, query: &ListQuery) -> Result<Page<PlaceView>, EngineError> {
        debug!(?query, "listing places");
        let params = Params::parse(query, PlaceField::Name, DEFAULT_PLACE_PAGE_LIMIT)?;
        let ids: Vec<Ulid> = self.places.iter().map(|e| *e.key()).collect();
        let mut views = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read_place(id).await {
                Ok(guard) => views.push(self.place_view(&guard.place)),
                Err(EngineError::NotFound(Entity::Place, _)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(paginate(views, &params))
    }
}
