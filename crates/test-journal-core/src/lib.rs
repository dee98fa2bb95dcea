//! Data model and notification seam shared by the test journal crates.
//!
//! The test-execution framework drives a [`LifecycleListener`] with
//! [`TestState`] payloads. Listeners are fanned out through a
//! [`ResultDispatcher`]; the `SQLite` journal recorder is one such listener.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum JournalError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("write failure: {0}")]
    WriteFailure(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("contract violation: {0}")]
    Contract(String),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum JournalAction {
    Started,
    Ended,
}

impl JournalAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::Ended => "ENDED",
        }
    }
}

/// Per-test notification payload delivered by the test-execution framework.
/// String fields are journaled verbatim, empty values included.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TestState {
    pub job_logdir: PathBuf,
    pub job_unique_id: String,
    pub tagged_name: String,
    pub status: Option<String>,
}

impl TestState {
    /// Returns the final outcome carried by an end-of-test notification.
    ///
    /// # Errors
    /// Returns [`JournalError::Validation`] when no status was supplied.
    pub fn end_status(&self) -> Result<&str, JournalError> {
        match self.status.as_deref() {
            Some(status) => Ok(status),
            None => Err(JournalError::Validation(format!(
                "status MUST be provided when test {} ends",
                self.tagged_name
            ))),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JobInfo {
    pub unique_id: String,
}

/// One append-only row of the journal. `flushed` is set by downstream
/// consumers once they forward a row; the writer always leaves it false.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct JournalEntry {
    pub tag: String,
    pub time: OffsetDateTime,
    pub action: JournalAction,
    pub status: Option<String>,
    pub flushed: bool,
}

impl JournalEntry {
    #[must_use]
    pub fn started(tag: &str, time: OffsetDateTime) -> Self {
        Self {
            tag: tag.to_string(),
            time,
            action: JournalAction::Started,
            status: None,
            flushed: false,
        }
    }

    #[must_use]
    pub fn ended(tag: &str, time: OffsetDateTime, status: &str) -> Self {
        Self {
            tag: tag.to_string(),
            time,
            action: JournalAction::Ended,
            status: Some(status.to_string()),
            flushed: false,
        }
    }

    /// Checks that `status` is present exactly when the action is `ENDED`
    /// and that the entry is not already marked flushed.
    ///
    /// # Errors
    /// Returns [`JournalError::Validation`] on a misplaced status or a flushed entry.
    pub fn validate(&self) -> Result<(), JournalError> {
        if self.flushed {
            return Err(JournalError::Validation(format!(
                "new journal entry for {} MUST NOT be marked flushed",
                self.tag
            )));
        }

        match (self.action, &self.status) {
            (JournalAction::Started, Some(_)) => Err(JournalError::Validation(
                "STARTED entries MUST NOT carry a status".to_string(),
            )),
            (JournalAction::Ended, None) => Err(JournalError::Validation(
                "ENDED entries MUST carry a status".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Typed switch for the optional journal feature.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct JournalConfig {
    pub enabled: bool,
}

/// Receiver of test lifecycle notifications, invoked in framework order:
/// each `start_test` before its `end_test`, all of them before `end_tests`.
pub trait LifecycleListener {
    #[allow(clippy::missing_errors_doc)]
    fn start_test(&mut self, state: &TestState) -> Result<(), JournalError>;

    #[allow(clippy::missing_errors_doc)]
    fn end_test(&mut self, state: &TestState) -> Result<(), JournalError>;

    #[allow(clippy::missing_errors_doc)]
    fn end_tests(&mut self) -> Result<(), JournalError>;
}

/// Forwards every notification to the registered listeners in registration
/// order. The first failing listener stops the notification.
#[derive(Default)]
pub struct ResultDispatcher<'a> {
    listeners: Vec<&'a mut dyn LifecycleListener>,
}

impl<'a> ResultDispatcher<'a> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: &'a mut dyn LifecycleListener) {
        self.listeners.push(listener);
    }
}

impl LifecycleListener for ResultDispatcher<'_> {
    fn start_test(&mut self, state: &TestState) -> Result<(), JournalError> {
        for listener in &mut self.listeners {
            listener.start_test(state)?;
        }
        Ok(())
    }

    fn end_test(&mut self, state: &TestState) -> Result<(), JournalError> {
        for listener in &mut self.listeners {
            listener.end_test(state)?;
        }
        Ok(())
    }

    fn end_tests(&mut self) -> Result<(), JournalError> {
        for listener in &mut self.listeners {
            listener.end_tests()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct RunSummary {
    pub tests_started: usize,
    pub tests_ended: usize,
    pub statuses: BTreeMap<String, usize>,
    pub finished: bool,
}

/// In-memory counter of lifecycle notifications.
#[derive(Debug, Clone, Default)]
pub struct RunTally {
    summary: RunSummary,
}

impl RunTally {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }
}

impl LifecycleListener for RunTally {
    fn start_test(&mut self, _state: &TestState) -> Result<(), JournalError> {
        self.summary.tests_started += 1;
        Ok(())
    }

    fn end_test(&mut self, state: &TestState) -> Result<(), JournalError> {
        let status = state.end_status()?;
        self.summary.tests_ended += 1;
        *self.summary.statuses.entry(status.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn end_tests(&mut self) -> Result<(), JournalError> {
        self.summary.finished = true;
        Ok(())
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Formats a journal timestamp as fixed-width UTC
/// (`YYYY-MM-DDTHH:MM:SS.ffffffZ`), so string order matches time order.
///
/// # Errors
/// Returns [`JournalError::Validation`] when formatting fails.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, JournalError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .map_err(|err| JournalError::Validation(format!("failed to format timestamp: {err}")))
}

/// Parses a timestamp produced by [`format_timestamp`].
///
/// # Errors
/// Returns [`JournalError::Validation`] when the value is not in journal format.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, JournalError> {
    PrimitiveDateTime::parse(
        value,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"),
    )
    .map(PrimitiveDateTime::assume_utc)
    .map_err(|err| JournalError::Validation(format!("invalid journal timestamp {value}: {err}")))
}
