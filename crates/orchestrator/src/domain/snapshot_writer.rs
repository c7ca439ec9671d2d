//! Background writer for registry snapshots

use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::thread::JoinHandle;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use tracing::error;

use super::registry::RegistrySnapshot;
use super::traits::PersistenceError;
use super::traits::SnapshotStore;

#[derive(Default)]
struct WriterState {
    /// Newest snapshot not yet handed to the store
    pending: Option<RegistrySnapshot>,
    writing: bool,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<WriterState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, WriterState>) -> MutexGuard<'a, WriterState> {
        self.changed
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Hands snapshots to a [`SnapshotStore`] on a dedicated thread.
///
/// Submitting never waits for I/O. Snapshots submitted while a write is in
/// progress replace each other, so only the newest one is written next.
/// Dropping the writer writes whatever is still pending before returning.
pub struct SnapshotWriter {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl SnapshotWriter {
    pub fn spawn(store: Arc<dyn SnapshotStore>) -> Result<Self, Report<PersistenceError>> {
        let shared = Arc::new(Shared::default());
        let thread = std::thread::Builder::new()
            .name("state writer".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || write_loop(&shared, store.as_ref())
            })
            .change_context(PersistenceError::WriterUnavailable)?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn submit(&self, snapshot: RegistrySnapshot) {
        let mut state = self.shared.lock();
        if state.pending.replace(snapshot).is_some() {
            debug!("superseded an unwritten registry snapshot");
        }
        self.shared.changed.notify_all();
    }

    /// Blocks until every submitted snapshot has been handed to the store.
    pub fn flush(&self) {
        let mut state = self.shared.lock();
        while state.pending.is_some() || state.writing {
            state = self.shared.wait(state);
        }
    }
}

impl Drop for SnapshotWriter {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.changed.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("state writer thread panicked");
            }
        }
    }
}

fn write_loop(shared: &Shared, store: &dyn SnapshotStore) {
    loop {
        let snapshot = {
            let mut state = shared.lock();
            loop {
                if let Some(snapshot) = state.pending.take() {
                    state.writing = true;
                    break snapshot;
                }
                if state.closed {
                    return;
                }
                state = shared.wait(state);
            }
        };

        if let Err(report) = store.save(&snapshot) {
            error!("Failed to persist host registry: {report:?}");
        }

        shared.lock().writing = false;
        shared.changed.notify_all();
    }
}
