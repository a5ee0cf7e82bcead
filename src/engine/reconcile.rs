//! Synchronizes a place's children against a submitted desired-state list.
//!
//! Deletes go first, as one call; updates and creates then run concurrently.
//! Planning is pure and validates the whole list before anything is written.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::future::{try_join, try_join_all};
use ulid::Ulid;

use crate::limits::{MAX_CHILDREN_PER_LIST, MAX_NAME_LEN};
use crate::model::*;

use super::error::Entity;
use super::{Engine, EngineError};

/// Storage capability the reconciler drives. Gates and turnstiles are two
/// instances over the same engine.
#[async_trait]
pub trait ChildCollection: Send + Sync {
    fn entity(&self) -> Entity;
    async fn list_by_parent(&self, parent_id: Ulid) -> Result<Vec<AccessPoint>, EngineError>;
    async fn create(&self, parent_id: Ulid, name: String) -> Result<AccessPoint, EngineError>;
    /// `None` keeps the stored name.
    async fn update(&self, id: Ulid, name: Option<String>) -> Result<AccessPoint, EngineError>;
    async fn delete(&self, id: Ulid) -> Result<AccessPoint, EngineError>;
    async fn delete_many(&self, parent_id: Ulid, ids: &[Ulid]) -> Result<usize, EngineError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub delete: Vec<Ulid>,
    pub update: Vec<(Ulid, Option<String>)>,
    pub create: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub deleted: Vec<Ulid>,
    pub updated: Vec<AccessPoint>,
    pub created: Vec<AccessPoint>,
}

pub(super) fn check_name(name: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

/// Split `desired` against `current` into delete/update/create sets.
///
/// Rejects, before anything is planned: an id that is not a current child
/// (`NotFound`), an id listed twice, and a record with neither id nor name.
pub fn plan(
    entity: Entity,
    current: &[AccessPoint],
    desired: &[ChildInput],
) -> Result<ReconcilePlan, EngineError> {
    if desired.len() > MAX_CHILDREN_PER_LIST {
        return Err(EngineError::LimitExceeded("too many children in one list"));
    }
    let current_ids: HashSet<Ulid> = current.iter().map(|c| c.id).collect();
    let mut seen = HashSet::new();
    let mut out = ReconcilePlan::default();

    for record in desired {
        if let Some(name) = &record.name {
            check_name(name)?;
        }
        match (record.id, &record.name) {
            (Some(id), name) => {
                if !current_ids.contains(&id) {
                    return Err(EngineError::NotFound(entity, id));
                }
                if !seen.insert(id) {
                    return Err(EngineError::InvalidInput(format!("{entity} {id} listed twice")));
                }
                out.update.push((id, name.clone()));
            }
            (None, Some(name)) => out.create.push(name.clone()),
            (None, None) => {
                return Err(EngineError::InvalidInput(format!(
                    "{entity} record needs an id or a name"
                )));
            }
        }
    }

    out.delete = current
        .iter()
        .map(|c| c.id)
        .filter(|id| !seen.contains(id))
        .collect();
    Ok(out)
}

/// Make `parent_id`'s children match `desired`.
pub async fn reconcile<C: ChildCollection + ?Sized>(
    collection: &C,
    parent_id: Ulid,
    desired: &[ChildInput],
) -> Result<ReconcileOutcome, EngineError> {
    let current = collection.list_by_parent(parent_id).await?;
    let plan = plan(collection.entity(), &current, desired)?;

    if !plan.delete.is_empty() {
        collection.delete_many(parent_id, &plan.delete).await?;
    }
    let updates = plan
        .update
        .iter()
        .map(|(id, name)| collection.update(*id, name.clone()));
    let creates = plan
        .create
        .iter()
        .map(|name| collection.create(parent_id, name.clone()));
    let (updated, created) = try_join(try_join_all(updates), try_join_all(creates)).await?;

    Ok(ReconcileOutcome {
        deleted: plan.delete,
        updated,
        created,
    })
}

/// Engine-backed collection for one kind of access point.
///
/// Every method assumes the caller holds the parent place's write lock.
pub struct EngineChildren<'a> {
    engine: &'a Engine,
    kind: AccessKind,
}

impl<'a> EngineChildren<'a> {
    pub fn new(engine: &'a Engine, kind: AccessKind) -> Self {
        Self { engine, kind }
    }

    fn not_found(&self, id: Ulid) -> EngineError {
        EngineError::NotFound(self.kind.into(), id)
    }
}

#[async_trait]
impl ChildCollection for EngineChildren<'_> {
    fn entity(&self) -> Entity {
        self.kind.into()
    }

    async fn list_by_parent(&self, parent_id: Ulid) -> Result<Vec<AccessPoint>, EngineError> {
        Ok(self.engine.table(self.kind).list_by_place(&parent_id))
    }

    async fn create(&self, parent_id: Ulid, name: String) -> Result<AccessPoint, EngineError> {
        check_name(&name)?;
        let child = AccessPoint {
            id: Ulid::new(),
            place_id: parent_id,
            name,
        };
        let change = Change::ChildCreated {
            kind: self.kind,
            child: child.clone(),
        };
        self.engine.persist_and_apply(&mut [], &change).await?;
        Ok(child)
    }

    async fn update(&self, id: Ulid, name: Option<String>) -> Result<AccessPoint, EngineError> {
        let current = self
            .engine
            .table(self.kind)
            .get(&id)
            .ok_or_else(|| self.not_found(id))?;
        let child = AccessPoint {
            name: name.unwrap_or_else(|| current.name.clone()),
            ..current.clone()
        };
        let change = Change::ChildUpdated {
            kind: self.kind,
            child: child.clone(),
            from_place: current.place_id,
        };
        self.engine.persist_and_apply(&mut [], &change).await?;
        Ok(child)
    }

    async fn delete(&self, id: Ulid) -> Result<AccessPoint, EngineError> {
        let current = self
            .engine
            .table(self.kind)
            .get(&id)
            .ok_or_else(|| self.not_found(id))?;
        let change = Change::ChildrenDeleted {
            kind: self.kind,
            place_id: current.place_id,
            ids: vec![id],
        };
        self.engine.persist_and_apply(&mut [], &change).await?;
        Ok(current)
    }

    async fn delete_many(&self, parent_id: Ulid, ids: &[Ulid]) -> Result<usize, EngineError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let change = Change::ChildrenDeleted {
            kind: self.kind,
            place_id: parent_id,
            ids: ids.to_vec(),
        };
        self.engine.persist_and_apply(&mut [], &change).await?;
        Ok(ids.len())
    }
}
