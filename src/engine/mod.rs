mod admission;
mod children;
mod conflict;
mod error;
mod events;
mod listing;
mod places;
mod reconcile;
mod store;

pub use admission::{parse_instant, Check, DateInput, Rejected};
pub use conflict::{first_conflict, overlaps};
pub use error::{ConflictReason, EngineError, Entity};
pub use reconcile::{plan, reconcile, ChildCollection, EngineChildren, ReconcileOutcome, ReconcilePlan};
pub use store::{ChildTable, NameIndex};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedPlace = Arc<RwLock<PlaceState>>;
pub(crate) type PlaceGuard = OwnedRwLockWriteGuard<PlaceState>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        change: Change,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Start keeping every record appended from here on, so a compaction
    /// snapshot built afterwards can be followed by what raced it.
    BeginCompact {
        response: oneshot::Sender<()>,
    },
    Compact {
        snapshot: Vec<Change>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Change, oneshot::Sender<io::Result<()>>);

struct Writer {
    wal: Wal,
    /// Records appended since `BeginCompact`, if a compaction is in flight.
    tail: Option<Vec<Change>>,
}

/// Owns the WAL. Blocks for one append, drains whatever else is already
/// queued, then fsyncs the whole batch once and answers every sender.
async fn wal_writer_loop(wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut w = Writer { wal, tail: None };
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { change, response } = cmd else {
            w.handle_control(cmd);
            continue;
        };
        let mut batch = vec![(change, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { change, response }) => batch.push((change, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        w.commit(batch);
        if let Some(cmd) = deferred {
            w.handle_control(cmd);
        }
    }
    debug!("WAL writer stopped");
}

impl Writer {
    fn commit(&mut self, mut batch: Vec<Pending>) {
        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let started = std::time::Instant::now();
        let result = self.flush_batch(&batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());

        if result.is_ok()
            && let Some(tail) = self.tail.as_mut()
        {
            tail.extend(batch.iter().map(|(c, _)| c.clone()));
        }
        for (_, tx) in batch.drain(..) {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }
    }

    fn flush_batch(&mut self, batch: &[Pending]) -> io::Result<()> {
        let result = batch
            .iter()
            .try_for_each(|(change, _)| self.wal.append_buffered(change))
            .and_then(|()| self.wal.flush_sync());
        if let Err(e) = &result {
            warn!(error = %e, records = batch.len(), "WAL batch failed, rolling back");
            if let Err(e) = self.wal.rollback() {
                error!(error = %e, "WAL rollback failed");
            }
        }
        result
    }

    fn handle_control(&mut self, cmd: WalCommand) {
        match cmd {
            WalCommand::BeginCompact { response } => {
                self.tail = Some(Vec::new());
                let _ = response.send(());
            }
            WalCommand::Compact { mut snapshot, response } => {
                snapshot.extend(self.tail.take().unwrap_or_default());
                let result = Wal::write_compact_file(self.wal.path(), &snapshot)
                    .and_then(|()| self.wal.swap_compact_file());
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(self.wal.appends_since_compact());
            }
            WalCommand::Append { change, response } => self.commit(vec![(change, response)]),
        }
    }
}

pub struct Engine {
    pub places: DashMap<Ulid, SharedPlace>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) place_names: NameIndex,
    pub(super) event_names: NameIndex,
    /// Reverse lookup: event id → owning place id.
    pub(super) event_to_place: DashMap<Ulid, Ulid>,
    pub(super) gates: ChildTable,
    pub(super) turnstiles: ChildTable,
    /// Held shared across append+apply, exclusively while compaction sets its
    /// mark, so no committed change is missing from both snapshot and tail.
    commit_gate: RwLock<()>,
}

/// Places whose locked state a change touches.
fn touched_places(change: &Change) -> Vec<Ulid> {
    match change {
        Change::PlaceUpdated { place } => vec![place.id],
        Change::PlaceDeleted { id } => vec![*id],
        Change::EventCreated { event } => vec![event.place_id],
        Change::EventUpdated { event, from_place } if *from_place != event.place_id => {
            vec![*from_place, event.place_id]
        }
        Change::EventUpdated { event, .. } => vec![event.place_id],
        Change::EventDeleted { place_id, .. } => vec![*place_id],
        Change::PlaceCreated { .. }
        | Change::ChildCreated { .. }
        | Change::ChildUpdated { .. }
        | Change::ChildrenDeleted { .. } => Vec::new(),
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (changes, dropped) = Wal::recover(&wal_path)?;
        if dropped > 0 {
            warn!(path = %wal_path.display(), bytes = dropped, "truncated torn WAL tail");
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            places: DashMap::new(),
            wal_tx,
            place_names: NameIndex::default(),
            event_names: NameIndex::default(),
            event_to_place: DashMap::new(),
            gates: ChildTable::default(),
            turnstiles: ChildTable::default(),
            commit_gate: RwLock::new(()),
        };

        // Sole owner of every Arc here, so `Arc::get_mut` always succeeds and
        // no lock is taken.
        for change in &changes {
            for place_id in touched_places(change) {
                if let Some(mut entry) = engine.places.get_mut(&place_id)
                    && let Some(lock) = Arc::get_mut(entry.value_mut())
                {
                    engine.apply_to_place(lock.get_mut(), change);
                }
            }
            engine.apply_to_tables(change);
        }

        info!(
            path = %wal_path.display(),
            records = changes.len(),
            places = engine.places.len(),
            events = engine.event_to_place.len(),
            "state restored from WAL"
        );
        Ok(engine)
    }

    pub fn table(&self, kind: AccessKind) -> &ChildTable {
        match kind {
            AccessKind::Gate => &self.gates,
            AccessKind::Turnstile => &self.turnstiles,
        }
    }

    pub fn get_place(&self, id: &Ulid) -> Option<SharedPlace> {
        self.places.get(id).map(|e| e.value().clone())
    }

    pub fn get_place_for_event(&self, event_id: &Ulid) -> Option<Ulid> {
        self.event_to_place.get(event_id).map(|e| *e.value())
    }

    async fn wal_append(&self, change: &Change) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                change: change.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, then apply to every held place and to the shared tables.
    pub(super) async fn persist_and_apply(
        &self,
        held: &mut [&mut PlaceState],
        change: &Change,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(change).await?;
        for ps in held.iter_mut() {
            self.apply_to_place(ps, change);
        }
        self.apply_to_tables(change);
        Ok(())
    }

    /// Changes to one place's locked state. Every arm is idempotent, so a
    /// compaction tail may replay records the snapshot already reflects.
    fn apply_to_place(&self, ps: &mut PlaceState, change: &Change) {
        match change {
            Change::PlaceUpdated { place } => {
                if ps.place.name != place.name {
                    self.place_names.release(&ps.place.name, place.id);
                }
                self.place_names.assign(&place.name, place.id);
                ps.place = place.clone();
            }
            Change::PlaceDeleted { id } => {
                self.place_names.release(&ps.place.name, *id);
                for event in ps.events.drain(..) {
                    self.event_names.release(&event.event, event.id);
                    self.event_to_place.remove(&event.id);
                }
            }
            Change::EventCreated { event } => {
                ps.remove_event(event.id);
                ps.insert_event(event.clone());
                self.event_names.assign(&event.event, event.id);
            }
            Change::EventUpdated { event, from_place } => {
                if ps.place.id == *from_place
                    && let Some(old) = ps.remove_event(event.id)
                    && old.event != event.event
                {
                    self.event_names.release(&old.event, old.id);
                }
                if ps.place.id == event.place_id {
                    ps.remove_event(event.id);
                    ps.insert_event(event.clone());
                    self.event_names.assign(&event.event, event.id);
                }
            }
            Change::EventDeleted { id, .. } => {
                if let Some(old) = ps.remove_event(*id) {
                    self.event_names.release(&old.event, old.id);
                }
            }
            Change::PlaceCreated { .. }
            | Change::ChildCreated { .. }
            | Change::ChildUpdated { .. }
            | Change::ChildrenDeleted { .. } => {}
        }
    }

    /// Changes to the DashMap-level tables. Runs after `apply_to_place`.
    fn apply_to_tables(&self, change: &Change) {
        match change {
            Change::PlaceCreated { place } => {
                self.place_names.assign(&place.name, place.id);
                self.places
                    .entry(place.id)
                    .or_insert_with(|| Arc::new(RwLock::new(PlaceState::new(place.clone()))));
            }
            Change::PlaceDeleted { id } => {
                self.places.remove(id);
                for kind in AccessKind::ALL {
                    self.table(kind).clear_place(id);
                }
            }
            Change::ChildCreated { kind, child } | Change::ChildUpdated { kind, child, .. } => {
                self.table(*kind).upsert(child.clone());
            }
            Change::ChildrenDeleted { kind, ids, .. } => {
                self.table(*kind).remove_many(ids);
            }
            Change::EventCreated { event } | Change::EventUpdated { event, .. } => {
                self.event_to_place.insert(event.id, event.place_id);
            }
            Change::EventDeleted { id, .. } => {
                self.event_to_place.remove(id);
            }
            Change::PlaceUpdated { .. } => {}
        }
    }

    /// Write-lock a place. Fails with `NotFound` if it is missing, including
    /// when it was deleted while we waited.
    pub(super) async fn lock_place(&self, id: Ulid) -> Result<PlaceGuard, EngineError> {
        let shared = self
            .get_place(&id)
            .ok_or(EngineError::NotFound(Entity::Place, id))?;
        let guard = shared.write_owned().await;
        if !self.places.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::Place, id));
        }
        Ok(guard)
    }

    pub(super) async fn read_place(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<PlaceState>, EngineError> {
        let shared = self
            .get_place(&id)
            .ok_or(EngineError::NotFound(Entity::Place, id))?;
        let guard = shared.read_owned().await;
        if !self.places.contains_key(&id) {
            return Err(EngineError::NotFound(Entity::Place, id));
        }
        Ok(guard)
    }

    /// Write-lock two places in ascending id order. Missing places come back
    /// as `None`. When `a == b` only the first slot is filled.
    pub(super) async fn lock_pair(
        &self,
        a: Ulid,
        b: Ulid,
    ) -> (Option<PlaceGuard>, Option<PlaceGuard>) {
        if a == b {
            return (self.lock_place(a).await.ok(), None);
        }
        if a < b {
            let ga = self.lock_place(a).await.ok();
            let gb = self.lock_place(b).await.ok();
            (ga, gb)
        } else {
            let gb = self.lock_place(b).await.ok();
            let ga = self.lock_place(a).await.ok();
            (ga, gb)
        }
    }

    /// Lock the place that owns an event. Retries if the event moved while we
    /// waited for the lock.
    pub(super) async fn resolve_event_write(
        &self,
        event_id: Ulid,
    ) -> Result<(Ulid, PlaceGuard), EngineError> {
        loop {
            let place_id = self
                .get_place_for_event(&event_id)
                .ok_or(EngineError::NotFound(Entity::Event, event_id))?;
            let guard = self.lock_place(place_id).await?;
            if guard.get_event(event_id).is_some() {
                return Ok((place_id, guard));
            }
        }
    }

    /// Rewrite the WAL as the minimal record set that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        {
            let _gate = self.commit_gate.write().await;
            let (tx, rx) = oneshot::channel();
            self.wal_tx
                .send(WalCommand::BeginCompact { response: tx })
                .await
                .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
            rx.await
                .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?;
        }

        let mut place_ids: Vec<Ulid> = self.places.iter().map(|e| *e.key()).collect();
        place_ids.sort();
        let mut snapshot = Vec::new();
        for id in place_ids {
            let Ok(ps) = self.read_place(id).await else {
                continue;
            };
            snapshot.push(Change::PlaceCreated {
                place: ps.place.clone(),
            });
            for kind in AccessKind::ALL {
                for child in self.table(kind).list_by_place(&id) {
                    snapshot.push(Change::ChildCreated { kind, child });
                }
            }
            for event in &ps.events {
                snapshot.push(Change::EventCreated {
                    event: event.clone(),
                });
            }
        }
        let records = snapshot.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!(records, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
