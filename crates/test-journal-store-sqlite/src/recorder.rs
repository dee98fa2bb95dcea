use std::path::{Path, PathBuf};

use test_journal_core::{
    now_utc, JobInfo, JournalEntry, JournalError, LifecycleListener, TestState,
};
use time::OffsetDateTime;

use crate::{journal_path, SqliteJournalStore};

enum RecorderState {
    Uninitialized,
    Active(ActiveJournal),
    Closed,
}

struct ActiveJournal {
    store: SqliteJournalStore,
    job_logdir: PathBuf,
}

/// Lifecycle listener that journals every test transition of one job.
///
/// Storage is bound on the first notification, since the job log directory is
/// only known from its payload, and released by [`LifecycleListener::end_tests`].
pub struct JournalRecorder {
    state: RecorderState,
    last_time: Option<OffsetDateTime>,
}

impl Default for JournalRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl JournalRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RecorderState::Uninitialized,
            last_time: None,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state, RecorderState::Active(_))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.state, RecorderState::Closed)
    }

    #[must_use]
    pub fn journal_path(&self) -> Option<&Path> {
        match &self.state {
            RecorderState::Active(active) => Some(active.store.path()),
            RecorderState::Uninitialized | RecorderState::Closed => None,
        }
    }
}

impl LifecycleListener for JournalRecorder {
    fn start_test(&mut self, state: &TestState) -> Result<(), JournalError> {
        let store = ensure_active(&mut self.state, state)?;
        let entry = JournalEntry::started(&state.tagged_name, next_time(&mut self.last_time));
        store.append_entry(&entry)
    }

    fn end_test(&mut self, state: &TestState) -> Result<(), JournalError> {
        let status = state.end_status()?;
        let store = ensure_active(&mut self.state, state)?;
        let entry = JournalEntry::ended(
            &state.tagged_name,
            next_time(&mut self.last_time),
            status,
        );
        store.append_entry(&entry)
    }

    fn end_tests(&mut self) -> Result<(), JournalError> {
        match std::mem::replace(&mut self.state, RecorderState::Closed) {
            RecorderState::Active(active) => active.store.close(),
            RecorderState::Uninitialized => {
                self.state = RecorderState::Uninitialized;
                tracing::debug!("no test ran; nothing to close");
                Ok(())
            }
            RecorderState::Closed => {
                tracing::debug!("journal already closed");
                Ok(())
            }
        }
    }
}

fn ensure_active<'s>(
    recorder_state: &'s mut RecorderState,
    state: &TestState,
) -> Result<&'s mut SqliteJournalStore, JournalError> {
    if matches!(recorder_state, RecorderState::Uninitialized) {
        let store = open_journal(state)?;
        *recorder_state = RecorderState::Active(ActiveJournal {
            store,
            job_logdir: state.job_logdir.clone(),
        });
    }

    match recorder_state {
        RecorderState::Active(active) => {
            if active.job_logdir != state.job_logdir {
                return Err(JournalError::Contract(format!(
                    "journal is bound to {} but test {} reports job_logdir {}",
                    active.job_logdir.display(),
                    state.tagged_name,
                    state.job_logdir.display()
                )));
            }
            Ok(&mut active.store)
        }
        RecorderState::Closed => Err(JournalError::Contract(format!(
            "journal already closed; cannot record test {}",
            state.tagged_name
        ))),
        RecorderState::Uninitialized => Err(JournalError::Contract(
            "journal failed to activate".to_string(),
        )),
    }
}

fn open_journal(state: &TestState) -> Result<SqliteJournalStore, JournalError> {
    let path = journal_path(&state.job_logdir);
    let mut store = SqliteJournalStore::open(&path)?;
    store.migrate()?;
    store.record_job_info(&JobInfo {
        unique_id: state.job_unique_id.clone(),
    })?;

    tracing::debug!(
        journal = %path.display(),
        job = %state.job_unique_id,
        "journal activated"
    );
    Ok(store)
}

// Wall-clock steps backwards are absorbed so one writer never emits a
// decreasing time.
fn next_time(last_time: &mut Option<OffsetDateTime>) -> OffsetDateTime {
    let now = now_utc();
    let time = match *last_time {
        Some(last) if now < last => last,
        _ => now,
    };
    *last_time = Some(time);
    time
}
