mod error;
mod grid;
mod mutations;
mod policy;
mod queries;
mod store;
mod txn;

pub use error::{EngineError, ErrorKind};
pub use grid::{first_aligned, Grid};
pub use policy::{available, select_all, select_first_n, select_spaced, spread, SpacedMatch, SpacedSelection};
pub use store::Ledger;
pub use txn::{Snapshot, Transaction};

use std::io;
use std::path::PathBuf;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that arrive while a batch is being collected share
/// one fsync; any other command flushes the open batch before it runs.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
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
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, path = %wal.path().display(), "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't join the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            flush_and_respond(wal, &mut batch);
        }
    }
}

/// One tenant's allocation state: band definitions plus the occupancy ledger.
///
/// Band reads go straight to the map. Every write (band or ledger) takes the
/// ledger write lock, so writes are serialized and compaction sees a stable
/// state.
pub struct Engine {
    pub(super) bands: DashMap<Ulid, Band>,
    pub(super) ledger: RwLock<Ledger>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

fn apply_event(bands: &DashMap<Ulid, Band>, ledger: &mut Ledger, event: &Event) {
    match event {
        Event::BandCreated { band } | Event::BandUpdated { band } => {
            bands.insert(band.id, band.clone());
        }
        Event::BandDeleted { id } => {
            bands.remove(id);
        }
        Event::LedgerCommitted { delta } => ledger.apply(delta),
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer task. Must be called
    /// inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;

        let bands = DashMap::new();
        let mut ledger = Ledger::new();
        for event in &events {
            apply_event(&bands, &mut ledger, event);
        }
        tracing::debug!(
            path = %wal_path.display(),
            events = events.len(),
            bands = bands.len(),
            occupied = ledger.occupied_count(),
            "WAL replayed"
        );

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        Ok(Self {
            bands,
            ledger: RwLock::new(ledger),
            wal_tx,
        })
    }

    /// Send a command to the WAL writer and wait for its reply.
    async fn wal_request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(make(tx))
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))
    }

    /// Durably append one event through the group-commit writer.
    pub(super) async fn wal_append(&self, event: Event) -> Result<(), EngineError> {
        self.wal_request(|response| WalCommand::Append { event, response })
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Start a write transaction. Waits for any other writer to finish.
    pub async fn begin(&self) -> Transaction<'_> {
        Transaction::new(self, self.ledger.write().await)
    }

    pub(super) fn require_band(&self, id: &Ulid) -> Result<Band, EngineError> {
        self.bands
            .get(id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::BandNotFound(*id))
    }
}
