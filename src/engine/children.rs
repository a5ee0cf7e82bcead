use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::error::Entity;
use super::reconcile::{check_name, ChildCollection, EngineChildren};
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_child(
        &self,
        kind: AccessKind,
        place_id: Ulid,
        name: String,
    ) -> Result<AccessPoint, EngineError> {
        info!(kind = kind.label(), place = %place_id, %name, "creating child");
        let _guard = self.lock_place(place_id).await?;
        EngineChildren::new(self, kind).create(place_id, name).await
    }

    /// Rename and/or re-parent. Moving locks both places.
    pub async fn update_child(
        &self,
        kind: AccessKind,
        id: Ulid,
        patch: ChildPatch,
    ) -> Result<AccessPoint, EngineError> {
        info!(kind = kind.label(), child = %id, "updating child");
        if let Some(name) = &patch.name {
            check_name(name)?;
        }
        let not_found = || EngineError::NotFound(kind.into(), id);
        loop {
            let current = self.table(kind).get(&id).ok_or_else(not_found)?;
            let target = patch.place_id.unwrap_or(current.place_id);
            let (from_guard, target_guard) = self.lock_pair(current.place_id, target).await;
            if target != current.place_id && target_guard.is_none() {
                return Err(EngineError::NotFound(Entity::Place, target));
            }
            // Re-read under the lock; retry if it moved meanwhile.
            match self.table(kind).get(&id) {
                Some(now) if now.place_id == current.place_id && from_guard.is_some() => {}
                Some(_) => continue,
                None => return Err(not_found()),
            }

            let child = AccessPoint {
                id,
                place_id: target,
                name: patch.name.clone().unwrap_or(current.name),
            };
            let change = Change::ChildUpdated {
                kind,
                child: child.clone(),
                from_place: current.place_id,
            };
            self.persist_and_apply(&mut [], &change).await?;
            return Ok(child);
        }
    }

    pub async fn delete_child(&self, kind: AccessKind, id: Ulid) -> Result<AccessPoint, EngineError> {
        info!(kind = kind.label(), child = %id, "deleting child");
        loop {
            let current = self
                .table(kind)
                .get(&id)
                .ok_or(EngineError::NotFound(kind.into(), id))?;
            let Ok(_guard) = self.lock_place(current.place_id).await else {
                continue;
            };
            if self
                .table(kind)
                .get(&id)
                .is_some_and(|c| c.place_id == current.place_id)
            {
                return EngineChildren::new(self, kind).delete(id).await;
            }
        }
    }

    pub fn find_child(&self, kind: AccessKind, id: Ulid) -> Result<AccessPoint, EngineError> {
        debug!(kind = kind.label(), child = %id, "finding child");
        self.table(kind)
            .get(&id)
            .ok_or(EngineError::NotFound(kind.into(), id))
    }

    /// All children of a kind, or only those of one place.
    pub fn list_children(&self, kind: AccessKind, place_id: Option<Ulid>) -> Vec<AccessPoint> {
        debug!(kind = kind.label(), ?place_id, "listing children");
        match place_id {
            Some(pid) => self.table(kind).list_by_place(&pid),
            None => self.table(kind).list_all(),
        }
    }
}
