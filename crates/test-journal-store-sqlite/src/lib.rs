#![allow(clippy::missing_errors_doc)]

//! `SQLite` persistence for the test journal.
//!
//! The on-disk file is a public artifact: downstream consumers open
//! `<job_logdir>/.journal.sqlite` directly, so the filename, table names and
//! column names below must stay stable.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use test_journal_core::{format_timestamp, JobInfo, JournalEntry, JournalError};

mod recorder;

pub use recorder::JournalRecorder;

pub const JOURNAL_FILENAME: &str = ".journal.sqlite";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TableSchema {
    pub name: &'static str,
    pub create_sql: &'static str,
}

pub const JOURNAL_SCHEMA: &[TableSchema] = &[
    TableSchema {
        name: "job_info",
        create_sql: "CREATE TABLE job_info (unique_id TEXT UNIQUE)",
    },
    TableSchema {
        name: "test_journal",
        create_sql: "CREATE TABLE test_journal (
            tag TEXT,
            time TEXT,
            action TEXT,
            status TEXT,
            flushed BOOLEAN DEFAULT 0
        )",
    },
];

#[must_use]
pub fn journal_path(job_logdir: &Path) -> PathBuf {
    job_logdir.join(JOURNAL_FILENAME)
}

pub struct SqliteJournalStore {
    conn: Connection,
    path: PathBuf,
}

impl SqliteJournalStore {
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let conn = Connection::open(path).map_err(|err| {
            JournalError::StorageUnavailable(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = FULL;",
        )
        .map_err(|err| {
            JournalError::StorageUnavailable(format!(
                "failed to configure sqlite pragmas for {}: {err}",
                path.display()
            ))
        })?;

        // Forces a header read so a non-database file fails here, not on first append.
        conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| {
            row.get::<_, i64>(0)
        })
        .map_err(|err| {
            JournalError::StorageUnavailable(format!(
                "failed to read sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        // SQLite silently falls back to read-only when the file is not writable.
        let read_only = conn.is_readonly(DatabaseName::Main).map_err(|err| {
            JournalError::StorageUnavailable(format!(
                "failed to inspect access mode of {}: {err}",
                path.display()
            ))
        })?;
        if read_only {
            return Err(JournalError::StorageUnavailable(format!(
                "sqlite database at {} is not writable",
                path.display()
            )));
        }

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn migrate(&self) -> Result<(), JournalError> {
        ensure_schema(&self.conn, JOURNAL_SCHEMA)
    }

    /// Stores the job identity unless one is already recorded. Returns
    /// whether a row was written.
    pub fn record_job_info(&mut self, job: &JobInfo) -> Result<bool, JournalError> {
        let existing = self
            .conn
            .query_row("SELECT unique_id FROM job_info LIMIT 1", [], |row| {
                row.get::<_, Option<String>>(0)
            })
            .optional()
            .map_err(|err| JournalError::WriteFailure(format!("failed to read job_info: {err}")))?;

        if let Some(recorded) = existing {
            if recorded.as_deref() != Some(job.unique_id.as_str()) {
                tracing::warn!(
                    journal = %self.path.display(),
                    recorded = ?recorded,
                    requested = %job.unique_id,
                    "journal already belongs to another job; keeping recorded id"
                );
            }
            return Ok(false);
        }

        let tx = self.conn.transaction().map_err(|err| {
            JournalError::WriteFailure(format!("failed to start job_info transaction: {err}"))
        })?;
        tx.execute(
            "INSERT INTO job_info (unique_id) VALUES (?1)",
            params![job.unique_id],
        )
        .map_err(|err| JournalError::WriteFailure(format!("failed to insert job_info: {err}")))?;
        tx.commit().map_err(|err| {
            JournalError::WriteFailure(format!("failed to commit job_info: {err}"))
        })?;

        tracing::debug!(journal = %self.path.display(), job = %job.unique_id, "recorded job info");
        Ok(true)
    }

    /// Appends one journal row and commits it before returning.
    pub fn append_entry(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        entry.validate()?;
        let time = format_timestamp(entry.time)?;

        let tx = self.conn.transaction().map_err(|err| {
            JournalError::WriteFailure(format!("failed to start journal transaction: {err}"))
        })?;
        tx.execute(
            "INSERT INTO test_journal (tag, time, action, status) VALUES (?1, ?2, ?3, ?4)",
            params![entry.tag, time, entry.action.as_str(), entry.status],
        )
        .map_err(|err| {
            JournalError::WriteFailure(format!(
                "failed to append {} entry for {}: {err}",
                entry.action.as_str(),
                entry.tag
            ))
        })?;
        tx.commit().map_err(|err| {
            JournalError::WriteFailure(format!("failed to commit journal entry: {err}"))
        })?;

        tracing::debug!(
            tag = %entry.tag,
            action = entry.action.as_str(),
            time = %time,
            "journal entry committed"
        );
        Ok(())
    }

    pub fn close(self) -> Result<(), JournalError> {
        let path = self.path;
        self.conn.close().map_err(|(_, err)| {
            JournalError::WriteFailure(format!(
                "failed to close journal {}: {err}",
                path.display()
            ))
        })?;
        tracing::info!(journal = %path.display(), "journal closed");
        Ok(())
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Creates each table in `tables` that the catalog does not already list.
/// Existing tables are left untouched, whatever their shape.
pub fn ensure_schema(conn: &Connection, tables: &[TableSchema]) -> Result<(), JournalError> {
    for table in tables {
        if table_exists(conn, table.name)? {
            continue;
        }

        conn.execute_batch(table.create_sql).map_err(|err| {
            JournalError::StorageUnavailable(format!(
                "failed to create table {}: {err}",
                table.name
            ))
        })?;
        tracing::debug!(table = table.name, "created journal table");
    }

    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, JournalError> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .map_err(|err| {
            JournalError::StorageUnavailable(format!("failed to query sqlite_master: {err}"))
        })?
        .is_some();

    Ok(exists)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use test_journal_core::{now_utc, parse_timestamp, JournalAction};
    use time::Duration;
    use ulid::Ulid;

    type Row = (String, String, String, Option<String>, bool);

    fn must<T>(result: Result<T, JournalError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn temp_journal_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("test-journal-{label}-{}", Ulid::new()));
        if let Err(err) = std::fs::create_dir_all(&dir) {
            panic!("failed to create temp dir {}: {err}", dir.display());
        }
        dir
    }

    fn fixture_store(label: &str) -> (PathBuf, SqliteJournalStore) {
        let dir = temp_journal_dir(label);
        let store = must(SqliteJournalStore::open(&journal_path(&dir)));
        must(store.migrate());
        (dir, store)
    }

    fn read_rows(path: &Path) -> Vec<Row> {
        let conn = match Connection::open_with_flags(path, rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY)
        {
            Ok(value) => value,
            Err(err) => panic!("failed to open reader connection: {err}"),
        };
        let mut stmt = match conn
            .prepare("SELECT tag, time, action, status, flushed FROM test_journal ORDER BY rowid")
        {
            Ok(value) => value,
            Err(err) => panic!("failed to prepare journal read: {err}"),
        };
        let rows = match stmt.query_map([], |row| -> rusqlite::Result<Row> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        }) {
            Ok(value) => value,
            Err(err) => panic!("failed to read journal: {err}"),
        };
        let mut values = Vec::new();
        for row in rows {
            match row {
                Ok(value) => values.push(value),
                Err(err) => panic!("failed to decode journal row: {err}"),
            }
        }
        values
    }

    fn job_ids(conn: &Connection) -> Vec<String> {
        let mut stmt = match conn.prepare("SELECT unique_id FROM job_info") {
            Ok(value) => value,
            Err(err) => panic!("failed to prepare job_info read: {err}"),
        };
        let rows = match stmt.query_map([], |row| row.get::<_, String>(0)) {
            Ok(value) => value,
            Err(err) => panic!("failed to read job_info: {err}"),
        };
        rows.map(|row| match row {
            Ok(value) => value,
            Err(err) => panic!("failed to decode job_info row: {err}"),
        })
        .collect()
    }

    fn column_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = match conn.prepare(&format!("PRAGMA table_info({table})")) {
            Ok(value) => value,
            Err(err) => panic!("failed to inspect {table}: {err}"),
        };
        let rows = match stmt.query_map([], |row| row.get::<_, String>(1)) {
            Ok(value) => value,
            Err(err) => panic!("failed to read table_info for {table}: {err}"),
        };
        rows.map(|row| match row {
            Ok(value) => value,
            Err(err) => panic!("failed to decode table_info row: {err}"),
        })
        .collect()
    }

    #[test]
    fn schema_contract_contains_expected_tables_and_columns() {
        let (dir, store) = fixture_store("schema");
        assert!(must(table_exists(store.connection(), "job_info")));
        assert!(must(table_exists(store.connection(), "test_journal")));
        assert_eq!(column_names(store.connection(), "job_info"), vec!["unique_id"]);
        assert_eq!(
            column_names(store.connection(), "test_journal"),
            vec!["tag", "time", "action", "status", "flushed"]
        );
        assert_eq!(store.path(), dir.join(".journal.sqlite"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_rows() {
        let (dir, mut store) = fixture_store("migrate");
        let path = store.path().to_path_buf();
        must(store.record_job_info(&JobInfo {
            unique_id: "job-123".to_string(),
        }));
        must(store.append_entry(&JournalEntry::started("testA", now_utc())));
        must(store.migrate());
        must(store.close());

        let reopened = must(SqliteJournalStore::open(&path));
        must(reopened.migrate());
        must(ensure_schema(reopened.connection(), JOURNAL_SCHEMA));

        assert_eq!(job_ids(reopened.connection()), vec!["job-123"]);
        let rows = read_rows(&path);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, "testA");
        must(reopened.close());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn ensure_schema_leaves_existing_tables_untouched() {
        let conn = match Connection::open_in_memory() {
            Ok(value) => value,
            Err(err) => panic!("failed to open in-memory db: {err}"),
        };
        if let Err(err) = conn.execute_batch("CREATE TABLE job_info (unique_id TEXT, extra TEXT)") {
            panic!("failed to seed table: {err}");
        }

        must(ensure_schema(&conn, JOURNAL_SCHEMA));

        assert_eq!(column_names(&conn, "job_info"), vec!["unique_id", "extra"]);
        assert!(must(table_exists(&conn, "test_journal")));
    }

    #[test]
    fn job_info_is_recorded_once() {
        let (dir, mut store) = fixture_store("jobinfo");
        let job = JobInfo {
            unique_id: "job-123".to_string(),
        };
        assert!(must(store.record_job_info(&job)));
        assert!(!must(store.record_job_info(&job)));
        assert!(!must(store.record_job_info(&JobInfo {
            unique_id: "job-456".to_string(),
        })));
        assert_eq!(job_ids(store.connection()), vec!["job-123"]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn committed_entry_is_visible_without_close() {
        let (dir, mut store) = fixture_store("durable");
        let path = store.path().to_path_buf();
        must(store.append_entry(&JournalEntry::started("testA", now_utc())));

        let rows = read_rows(&path);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].2, "STARTED");
        assert_eq!(rows[0].3, None);
        assert!(!rows[0].4);

        // Writer is abandoned without an orderly close.
        std::mem::forget(store);
        assert_eq!(read_rows(&path).len(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn append_rejects_entries_marked_flushed() {
        let (dir, mut store) = fixture_store("flushed");
        let mut entry = JournalEntry::started("testA", now_utc());
        entry.flushed = true;
        assert!(matches!(
            store.append_entry(&entry),
            Err(JournalError::Validation(_))
        ));
        assert!(read_rows(store.path()).is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn append_rejects_misplaced_status() {
        let (dir, mut store) = fixture_store("misplaced");
        let mut entry = JournalEntry::started("testA", now_utc());
        entry.status = Some("PASS".to_string());
        let err = match store.append_entry(&entry) {
            Ok(()) => panic!("expected misplaced status to be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, JournalError::Validation(_)));
        assert!(read_rows(store.path()).is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn open_fails_when_directory_is_missing() {
        let missing = std::env::temp_dir()
            .join(format!("test-journal-missing-{}", Ulid::new()))
            .join("nested");
        let err = match SqliteJournalStore::open(&journal_path(&missing)) {
            Ok(_) => panic!("expected open to fail for a missing directory"),
            Err(err) => err,
        };
        assert!(matches!(err, JournalError::StorageUnavailable(_)));
        assert!(err.to_string().contains(".journal.sqlite"));
    }

    #[test]
    fn open_rejects_a_file_that_is_not_a_database() {
        let dir = temp_journal_dir("corrupt");
        let path = journal_path(&dir);
        if let Err(err) = std::fs::write(&path, b"this is not a sqlite database file at all") {
            panic!("failed to seed corrupt file: {err}");
        }

        let err = match SqliteJournalStore::open(&path) {
            Ok(_) => panic!("expected open to fail for a corrupt file"),
            Err(err) => err,
        };
        assert!(matches!(err, JournalError::StorageUnavailable(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn open_rejects_a_journal_that_is_not_writable() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, mut store) = fixture_store("readonly");
        let path = store.path().to_path_buf();
        must(store.record_job_info(&JobInfo {
            unique_id: "job-123".to_string(),
        }));
        must(store.close());

        if let Err(err) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o444))
        {
            panic!("failed to make journal read-only: {err}");
        }
        // Privileged users bypass file modes, so the scenario cannot be staged.
        if std::fs::OpenOptions::new().write(true).open(&path).is_ok() {
            let _ = std::fs::remove_dir_all(&dir);
            return;
        }

        let err = match SqliteJournalStore::open(&path) {
            Ok(_) => panic!("expected open to fail for a read-only journal"),
            Err(err) => err,
        };
        assert!(matches!(err, JournalError::StorageUnavailable(_)));
        assert!(err.to_string().contains("not writable"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn write_after_table_loss_reports_write_failure() {
        let (dir, mut store) = fixture_store("writefail");
        if let Err(err) = store.connection().execute_batch("DROP TABLE test_journal") {
            panic!("failed to drop table: {err}");
        }
        let err = match store.append_entry(&JournalEntry::started("testA", now_utc())) {
            Ok(()) => panic!("expected append to fail"),
            Err(err) => err,
        };
        assert!(matches!(err, JournalError::WriteFailure(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_rows_keep_issue_order_and_status_placement(
            outcomes in prop::collection::vec(prop::option::of("[A-Z]{4}"), 1..24)
        ) {
            let (dir, mut store) = fixture_store("prop");
            let base = now_utc();
            let mut tick = 0_i64;
            let mut next_time = || {
                tick += 1;
                base + Duration::microseconds(tick)
            };
            let mut expected = Vec::new();
            for (index, outcome) in outcomes.iter().enumerate() {
                let tag = format!("test-{index}");
                must(store.append_entry(&JournalEntry::started(&tag, next_time())));
                expected.push((tag.clone(), JournalAction::Started, None));
                if let Some(status) = outcome {
                    must(store.append_entry(&JournalEntry::ended(&tag, next_time(), status)));
                    expected.push((tag, JournalAction::Ended, Some(status.clone())));
                }
            }

            let rows = read_rows(store.path());
            prop_assert_eq!(rows.len(), expected.len());
            let mut previous = None;
            for (row, (tag, action, status)) in rows.iter().zip(expected.iter()) {
                prop_assert_eq!(&row.0, tag);
                prop_assert_eq!(row.2.as_str(), action.as_str());
                prop_assert_eq!(&row.3, status);
                prop_assert!(!row.4);
                let time = must(parse_timestamp(&row.1));
                if let Some(prev) = previous {
                    prop_assert!(prev < time);
                }
                previous = Some(time);
            }
            must(store.close());
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}
