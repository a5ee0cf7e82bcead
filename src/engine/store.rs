use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::*;

/// One kind of access point (gates or turnstiles), with a per-place index.
///
/// Rows are not behind the place lock; the services that mutate children take
/// the owning place's write lock themselves.
#[derive(Default)]
pub struct ChildTable {
    rows: DashMap<Ulid, AccessPoint>,
    by_place: DashMap<Ulid, Vec<Ulid>>,
}

impl ChildTable {
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, id: &Ulid) -> Option<AccessPoint> {
        self.rows.get(id).map(|r| r.value().clone())
    }

    /// Children of one place, in creation order.
    pub fn list_by_place(&self, place_id: &Ulid) -> Vec<AccessPoint> {
        let ids = self
            .by_place
            .get(place_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Every row, ordered by id.
    pub fn list_all(&self) -> Vec<AccessPoint> {
        let mut all: Vec<AccessPoint> = self.rows.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|c| c.id);
        all
    }

    #[cfg(test)]
    pub fn count_for(&self, place_id: &Ulid) -> usize {
        self.by_place.get(place_id).map_or(0, |ids| ids.len())
    }

    /// Insert or overwrite a row, moving it between places if its parent
    /// changed.
    pub fn upsert(&self, child: AccessPoint) {
        let previous = self.rows.insert(child.id, child.clone());
        if let Some(prev) = previous {
            if prev.place_id == child.place_id {
                return;
            }
            self.unindex(&prev.place_id, &prev.id);
        }
        self.by_place.entry(child.place_id).or_default().push(child.id);
    }

    pub fn remove(&self, id: &Ulid) -> Option<AccessPoint> {
        let (_, child) = self.rows.remove(id)?;
        self.unindex(&child.place_id, id);
        Some(child)
    }

    pub fn remove_many(&self, ids: &[Ulid]) -> Vec<AccessPoint> {
        ids.iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Drop every child of a place. Returns the removed ids.
    pub fn clear_place(&self, place_id: &Ulid) -> Vec<Ulid> {
        let ids = self
            .by_place
            .remove(place_id)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        for id in &ids {
            self.rows.remove(id);
        }
        ids
    }

    fn unindex(&self, place_id: &Ulid, id: &Ulid) {
        if let Entry::Occupied(mut ids) = self.by_place.entry(*place_id) {
            ids.get_mut().retain(|c| c != id);
            if ids.get().is_empty() {
                ids.remove();
            }
        }
    }
}

/// Global name → owner index with reserve-before-write semantics.
#[derive(Default)]
pub struct NameIndex {
    owners: DashMap<String, Ulid>,
}

impl NameIndex {
    pub fn owner(&self, name: &str) -> Option<Ulid> {
        self.owners.get(name).map(|o| *o.value())
    }

    /// Claim `name` for `id`. Fails with the current holder if someone else
    /// has it. Re-claiming one's own name succeeds.
    pub fn reserve(&self, name: &str, id: Ulid) -> Result<(), Ulid> {
        match self.owners.entry(name.to_string()) {
            Entry::Occupied(o) if *o.get() != id => Err(*o.get()),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(v) => {
                v.insert(id);
                Ok(())
            }
        }
    }

    /// Unconditional claim, used when applying committed changes.
    pub fn assign(&self, name: &str, id: Ulid) {
        self.owners.insert(name.to_string(), id);
    }

    /// Drop the claim, but only if `id` still holds it.
    pub fn release(&self, name: &str, id: Ulid) {
        self.owners.remove_if(name, |_, owner| *owner == id);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.owners.len()
    }
}
