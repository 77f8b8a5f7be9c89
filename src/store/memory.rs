use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::{Event, Ms, Slot, SlotStatus};
use crate::observability;
use crate::wal::Wal;

use super::{SlotStore, StoreError, check_insertable};

pub type SharedSlot = Arc<RwLock<Slot>>;

// ── Group-commit journal channel ─────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the journal and batches appends for group commit.
/// 1. Block until a command arrives.
/// 2. For an Append, drain every Append already queued behind it.
/// 3. One flush + fsync for the whole batch, then answer every sender.
///    A failed batch is rolled back off the file and every sender gets the error.
/// 4. A non-append command found while draining runs after the batch is flushed.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(observability::JOURNAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(observability::JOURNAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let reply = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(reply);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    debug!("journal writer stopped");
}

/// All or nothing: on any error the journal is truncated back to its
/// length before the batch.
fn flush_batch(wal: &mut Wal<Event>, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if let Err(e) = &result {
        warn!(records = batch.len(), "journal batch failed, rolling back: {e}");
        if let Err(rollback_err) = wal.rollback() {
            error!("journal rollback failed, file may hold uncommitted records: {rollback_err}");
        }
    }
    result
}

fn handle_non_append(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Slot table held in memory, optionally backed by an append-only journal.
///
/// Every slot sits behind its own lock. A conditional update holds the slot's
/// write lock across predicate check, journal commit and apply, so concurrent
/// callers on the same slot are resolved one at a time while different slots
/// proceed in parallel.
///
/// Once an event is handed to the journal, commit and apply finish on a
/// spawned task that owns the lock guard. Dropping the caller's future at
/// any await point cannot leave the journal ahead of memory.
pub struct MemoryStore {
    slots: Arc<DashMap<Ulid, SharedSlot>>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Serializes inserts so a duplicate check and its journal write can't interleave.
    create_lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    /// Volatile store with no journal.
    pub fn ephemeral() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            wal_tx: None,
            create_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Replay the journal at `wal_path` and start its writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: PathBuf) -> Result<Self, StoreError> {
        let events: Vec<Event> = Wal::replay(&wal_path).map_err(journal_err)?;
        let wal = Wal::open(&wal_path).map_err(journal_err)?;

        let replayed = events.len();
        let mut table: HashMap<Ulid, Slot> = HashMap::new();
        for event in events {
            match event {
                Event::SlotCreated { slot } => {
                    table.insert(slot.id, slot);
                }
                other => match table.get_mut(&other.slot_id()) {
                    Some(slot) => slot.apply(&other),
                    None => warn!("journal record for unknown slot {}, skipped", other.slot_id()),
                },
            }
        }

        let slots = DashMap::with_capacity(table.len());
        for (id, slot) in table {
            slots.insert(id, Arc::new(RwLock::new(slot)));
        }
        info!(path = %wal_path.display(), replayed, slots = slots.len(), "journal replayed");

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            slots: Arc::new(slots),
            wal_tx: Some(wal_tx),
            create_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn cell(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    /// Journal `event`, then apply it to the locked slot. Runs to completion
    /// on its own task even if the caller goes away.
    async fn commit(&self, mut slot: OwnedRwLockWriteGuard<Slot>, event: Event) -> Result<Slot, StoreError> {
        let wal_tx = self.wal_tx.clone();
        let task = tokio::spawn(async move {
            persist(wal_tx.as_ref(), &event).await?;
            slot.apply(&event);
            Ok::<_, StoreError>(slot.clone())
        });
        task.await
            .map_err(|e| StoreError::Journal(format!("commit task failed: {e}")))?
    }

    /// Rewrite the journal as one `SlotCreated` per current slot.
    ///
    /// Read locks on every slot are held until the swap completes, so no
    /// mutation can commit to the old file after its snapshot was taken.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _creating = self.create_lock.lock().await;

        // Lock in id order, same as any other multi-slot acquisition.
        let mut ids: Vec<Ulid> = self.slots.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(cell) = self.cell(id) {
                guards.push(cell.read_owned().await);
            }
        }
        let events: Vec<Event> = guards
            .iter()
            .map(|slot| Event::SlotCreated { slot: (**slot).clone() })
            .collect();

        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Journal("journal writer dropped response".into()))?
            .map_err(journal_err)
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl SlotStore for MemoryStore {
    async fn conditional_acquire(
        &self,
        id: Ulid,
        holder: &str,
        now: Ms,
        ttl: Ms,
    ) -> Result<Option<Slot>, StoreError> {
        let Some(cell) = self.cell(&id) else {
            return Ok(None);
        };
        let slot = cell.write_owned().await;
        if !slot.is_acquirable(now) {
            return Ok(None);
        }
        let event = Event::HoldAcquired {
            id,
            holder: holder.to_string(),
            expires_at: now + ttl,
        };
        self.commit(slot, event).await.map(Some)
    }

    async fn conditional_release(&self, id: Ulid, holder: &str) -> Result<Option<Slot>, StoreError> {
        let Some(cell) = self.cell(&id) else {
            return Ok(None);
        };
        let slot = cell.write_owned().await;
        let held_by_caller = slot.status == SlotStatus::Held
            && slot.held_by.as_deref() == Some(holder);
        if !held_by_caller {
            return Ok(None);
        }
        self.commit(slot, Event::HoldReleased { id }).await.map(Some)
    }

    async fn insert_slot(&self, slot: Slot) -> Result<(), StoreError> {
        check_insertable(&slot)?;
        let creating = self.create_lock.clone().lock_owned().await;
        if self.slots.contains_key(&slot.id) {
            return Err(StoreError::AlreadyExists(slot.id));
        }
        let wal_tx = self.wal_tx.clone();
        let slots = self.slots.clone();
        let task = tokio::spawn(async move {
            let _creating = creating;
            persist(wal_tx.as_ref(), &Event::SlotCreated { slot: slot.clone() }).await?;
            slots.insert(slot.id, Arc::new(RwLock::new(slot)));
            Ok::<_, StoreError>(())
        });
        task.await
            .map_err(|e| StoreError::Journal(format!("insert task failed: {e}")))?
    }

    async fn get_slot(&self, id: Ulid) -> Result<Option<Slot>, StoreError> {
        match self.cell(&id) {
            Some(cell) => Ok(Some(cell.read().await.clone())),
            None => Ok(None),
        }
    }
}

/// Background task that compacts the journal once enough appends pile up.
/// Never touches slot state.
pub async fn run_compactor(store: Arc<MemoryStore>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(10));
    loop {
        interval.tick().await;
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!(appends, slots = store.slot_count(), "journal compacted"),
            Err(e) => warn!("journal compaction failed: {e}"),
        }
    }
}

/// Commit an event to the journal. No-op for ephemeral stores.
async fn persist(wal_tx: Option<&mpsc::Sender<WalCommand>>, event: &Event) -> Result<(), StoreError> {
    let Some(wal_tx) = wal_tx else {
        return Ok(());
    };
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| StoreError::Journal("journal writer shut down".into()))?;
    rx.await
        .map_err(|_| StoreError::Journal("journal writer dropped response".into()))?
        .map_err(journal_err)
}

fn journal_err(e: io::Error) -> StoreError {
    StoreError::Journal(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HOLD_TTL_MS;

    const M: Ms = 60_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotlease_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(path.with_extension("wal.tmp"));
        path
    }

    fn lesson() -> Slot {
        Slot::open(Ulid::new(), "tutor-1", 9 * 60 * M, 10 * 60 * M, 4500)
    }

    #[tokio::test]
    async fn acquire_sets_lease_fields() {
        let store = MemoryStore::ephemeral();
        let slot = lesson();
        store.insert_slot(slot.clone()).await.unwrap();

        let held = store
            .conditional_acquire(slot.id, "alice", 1_000, HOLD_TTL_MS)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.status, SlotStatus::Held);
        assert_eq!(held.held_by.as_deref(), Some("alice"));
        assert_eq!(held.hold_expires_at, Some(1_000 + HOLD_TTL_MS));
        assert_eq!(store.get_slot(slot.id).await.unwrap(), Some(held));
    }

    #[tokio::test]
    async fn acquire_unknown_slot_is_no_match() {
        let store = MemoryStore::ephemeral();
        let result = store.conditional_acquire(Ulid::new(), "alice", 0, HOLD_TTL_MS).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn acquire_booked_slot_is_no_match() {
        let store = MemoryStore::ephemeral();
        let mut slot = lesson();
        slot.status = SlotStatus::Booked;
        store.insert_slot(slot.clone()).await.unwrap();

        let result = store.conditional_acquire(slot.id, "alice", 0, HOLD_TTL_MS).await.unwrap();
        assert!(result.is_none());
        assert_eq!(store.get_slot(slot.id).await.unwrap(), Some(slot));
    }

    #[tokio::test]
    async fn release_requires_matching_holder() {
        let store = MemoryStore::ephemeral();
        let slot = lesson();
        store.insert_slot(slot.clone()).await.unwrap();
        store.conditional_acquire(slot.id, "alice", 0, HOLD_TTL_MS).await.unwrap();

        assert!(store.conditional_release(slot.id, "bob").await.unwrap().is_none());
        let reopened = store.conditional_release(slot.id, "alice").await.unwrap().unwrap();
        assert_eq!(reopened.status, SlotStatus::Open);
        assert!(store.conditional_release(slot.id, "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_never_reopens_booked_slot() {
        let store = MemoryStore::ephemeral();
        let mut slot = lesson();
        slot.status = SlotStatus::Booked;
        slot.held_by = Some("alice".into());
        slot.hold_expires_at = Some(HOLD_TTL_MS);
        store.insert_slot(slot.clone()).await.unwrap();

        assert!(store.conditional_release(slot.id, "alice").await.unwrap().is_none());
        assert_eq!(store.get_slot(slot.id).await.unwrap().unwrap().status, SlotStatus::Booked);
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = MemoryStore::ephemeral();
        let slot = lesson();
        store.insert_slot(slot.clone()).await.unwrap();
        let err = store.insert_slot(slot.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(id) if id == slot.id));
    }

    #[tokio::test]
    async fn journal_replay_restores_leases() {
        let path = test_wal_path("replay_restores.wal");
        let held_slot = lesson();
        let released_slot = lesson();
        {
            let store = MemoryStore::open(path.clone()).unwrap();
            store.insert_slot(held_slot.clone()).await.unwrap();
            store.insert_slot(released_slot.clone()).await.unwrap();
            store.conditional_acquire(held_slot.id, "alice", 5 * M, HOLD_TTL_MS).await.unwrap();
            store.conditional_acquire(released_slot.id, "bob", 5 * M, HOLD_TTL_MS).await.unwrap();
            store.conditional_release(released_slot.id, "bob").await.unwrap();
        }

        let store = MemoryStore::open(path).unwrap();
        assert_eq!(store.slot_count(), 2);
        let held = store.get_slot(held_slot.id).await.unwrap().unwrap();
        assert_eq!(held.held_by.as_deref(), Some("alice"));
        assert_eq!(held.hold_expires_at, Some(5 * M + HOLD_TTL_MS));
        let open = store.get_slot(released_slot.id).await.unwrap().unwrap();
        assert_eq!(open.status, SlotStatus::Open);
        assert_eq!(open.held_by, None);
    }

    #[tokio::test]
    async fn failed_predicate_writes_nothing() {
        let path = test_wal_path("no_match_no_write.wal");
        let store = MemoryStore::open(path).unwrap();
        let slot = lesson();
        store.insert_slot(slot.clone()).await.unwrap();
        store.conditional_acquire(slot.id, "alice", 0, HOLD_TTL_MS).await.unwrap();
        assert_eq!(store.appends_since_compact().await, 2);

        assert!(store.conditional_acquire(slot.id, "bob", M, HOLD_TTL_MS).await.unwrap().is_none());
        assert!(store.conditional_release(slot.id, "bob").await.unwrap().is_none());
        assert_eq!(store.appends_since_compact().await, 2);
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compaction_preserves.wal");
        let slot = lesson();
        {
            let store = MemoryStore::open(path.clone()).unwrap();
            store.insert_slot(slot.clone()).await.unwrap();
            for i in 0..25 {
                let now = i * 20 * M;
                let holder = format!("student-{i}");
                store.conditional_acquire(slot.id, &holder, now, HOLD_TTL_MS).await.unwrap().unwrap();
            }
            let before = std::fs::metadata(&path).unwrap().len();
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
            let after = std::fs::metadata(&path).unwrap().len();
            assert!(after < before, "compacted journal should shrink: {after} < {before}");

            // appends after compaction land in the new file
            store.conditional_release(slot.id, "student-24").await.unwrap().unwrap();
        }

        let store = MemoryStore::open(path).unwrap();
        let restored = store.get_slot(slot.id).await.unwrap().unwrap();
        assert_eq!(restored.status, SlotStatus::Open);
        assert_eq!(restored.held_by, None);
    }

    #[tokio::test]
    async fn compaction_on_ephemeral_store_is_noop() {
        let store = MemoryStore::ephemeral();
        store.insert_slot(lesson()).await.unwrap();
        store.compact().await.unwrap();
        assert_eq!(store.appends_since_compact().await, 0);
    }

    #[tokio::test]
    async fn concurrent_acquires_single_winner_with_journal() {
        let path = test_wal_path("concurrent_journal.wal");
        let store = Arc::new(MemoryStore::open(path.clone()).unwrap());
        let slot = lesson();
        store.insert_slot(slot.clone()).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .conditional_acquire(slot.id, &format!("student-{i}"), 0, HOLD_TTL_MS)
                    .await
                    .unwrap()
            }));
        }
        let mut winners = Vec::new();
        for h in handles {
            if let Some(s) = h.await.unwrap() {
                winners.push(s);
            }
        }
        assert_eq!(winners.len(), 1);
        // one create + one hold
        assert_eq!(store.appends_since_compact().await, 2);
        drop(store);

        let reopened = MemoryStore::open(path).unwrap();
        let restored = reopened.get_slot(slot.id).await.unwrap().unwrap();
        assert_eq!(restored.held_by, winners[0].held_by);
    }

    #[tokio::test]
    async fn insert_rejects_broken_rows() {
        let store = MemoryStore::ephemeral();

        let mut holder_without_expiry = lesson();
        holder_without_expiry.status = SlotStatus::Held;
        holder_without_expiry.held_by = Some("alice".into());

        let mut expiry_without_holder = lesson();
        expiry_without_holder.hold_expires_at = Some(HOLD_TTL_MS);

        let mut held_without_holder = lesson();
        held_without_holder.status = SlotStatus::Held;

        let mut empty_window = lesson();
        empty_window.ends_at = empty_window.starts_at;

        for slot in [holder_without_expiry, expiry_without_holder, held_without_holder, empty_window] {
            let err = store.insert_slot(slot.clone()).await.unwrap_err();
            assert!(matches!(err, StoreError::InvalidSlot { id, .. } if id == slot.id), "{slot:?}");
            assert!(store.conditional_acquire(slot.id, "bob", 0, HOLD_TTL_MS).await.unwrap().is_none());
        }
        assert_eq!(store.slot_count(), 0);
    }

    // Poll once so the event reaches the journal writer, then drop the caller.
    #[tokio::test]
    async fn cancelled_acquire_still_applies() {
        use futures::FutureExt;

        let path = test_wal_path("cancelled_acquire.wal");
        let slot = lesson();
        let store = MemoryStore::open(path.clone()).unwrap();
        store.insert_slot(slot.clone()).await.unwrap();

        let _ = store.conditional_acquire(slot.id, "alice", 0, HOLD_TTL_MS).now_or_never();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let live = store.get_slot(slot.id).await.unwrap().unwrap();
        assert_eq!(live.held_by.as_deref(), Some("alice"));
        drop(store);

        let replayed = MemoryStore::open(path).unwrap().get_slot(slot.id).await.unwrap().unwrap();
        assert_eq!(live, replayed);
    }

    #[tokio::test]
    async fn cancelled_release_still_applies() {
        use futures::FutureExt;

        let path = test_wal_path("cancelled_release.wal");
        let slot = lesson();
        let store = MemoryStore::open(path.clone()).unwrap();
        store.insert_slot(slot.clone()).await.unwrap();
        store.conditional_acquire(slot.id, "alice", 0, HOLD_TTL_MS).await.unwrap().unwrap();

        let _ = store.conditional_release(slot.id, "alice").now_or_never();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let live = store.get_slot(slot.id).await.unwrap().unwrap();
        assert_eq!(live.status, SlotStatus::Open);
        drop(store);

        let replayed = MemoryStore::open(path).unwrap().get_slot(slot.id).await.unwrap().unwrap();
        assert_eq!(live, replayed);
    }

    #[tokio::test]
    async fn cancelled_insert_still_applies() {
        use futures::FutureExt;

        let path = test_wal_path("cancelled_insert.wal");
        let slot = lesson();
        let store = MemoryStore::open(path.clone()).unwrap();

        let _ = store.insert_slot(slot.clone()).now_or_never();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(store.get_slot(slot.id).await.unwrap(), Some(slot.clone()));
        drop(store);

        let reopened = MemoryStore::open(path).unwrap();
        assert_eq!(reopened.get_slot(slot.id).await.unwrap(), Some(slot));
    }

    // /dev/full accepts the open and fails every write with ENOSPC.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn failed_journal_write_changes_nothing() {
        let store = MemoryStore::open(PathBuf::from("/dev/full")).unwrap();
        let slot = lesson();

        let err = store.insert_slot(slot.clone()).await.unwrap_err();
        assert!(matches!(err, StoreError::Journal(_)), "{err}");
        assert_eq!(store.slot_count(), 0);
        assert_eq!(store.get_slot(slot.id).await.unwrap(), None);
        assert_eq!(store.appends_since_compact().await, 0);
    }
}
