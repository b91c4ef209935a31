//! SQLite persistence for submissions and released features.
//!
//! Each row keeps the whole record as a JSON document next to the few
//! columns the pipeline queries on. Submissions carry a version counter:
//! [`Store::save`] is a compare-and-swap, so an HTTP handler and a pipeline
//! pass racing on the same submission produce a [`StoreError::Conflict`]
//! instead of a lost write.

use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::model::{ReleasedFeature, Status, Submission};

/// CAS attempts before giving up on a contended submission.
pub(crate) const MAX_CAS_ATTEMPTS: usize = 5;

/// Whole-collection documents exported next to the artifacts on release.
pub const SUBMISSIONS_SNAPSHOT: &str = "data/submissions.json";
pub const FEATURES_SNAPSHOT: &str = "data/features.json";

/// Error code recorded on a submission cancelled by its owner.
pub const CANCELLED_ERROR: &str = "CANCELLED_BY_USER";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("STORE_DB:{0}")]
    Database(#[from] rusqlite::Error),
    #[error("STORE_SERIALIZATION:{0}")]
    Serialization(#[from] serde_json::Error),
    #[error("STORE_IO:{0}")]
    Io(#[from] std::io::Error),
    #[error("SUBMISSION_NOT_FOUND:{0}")]
    NotFound(i64),
    #[error("NOT_CANCELLABLE:{status}")]
    NotCancellable { id: i64, status: Status },
    #[error("VERSION_CONFLICT:{0}")]
    Conflict(i64),
}

pub struct Store {
    db: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self {
            db: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            db: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let db = self.db.lock();
        db.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS submissions (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                status     TEXT NOT NULL,
                version    INTEGER NOT NULL DEFAULT 0,
                doc_json   TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_submissions_status
                ON submissions(status);

            CREATE TABLE IF NOT EXISTS released_features (
                id           INTEGER PRIMARY KEY,
                feature_file TEXT NOT NULL,
                doc_json     TEXT NOT NULL,
                released_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_features_file
                ON released_features(feature_file);
            ",
        )?;
        Ok(())
    }

    // ── Submissions ────────────────────────────────────────────────────

    /// Insert a new RECEIVED submission and return it with its assigned id.
    pub fn create_submission(&self, request: &str) -> Result<Submission, StoreError> {
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO submissions (status, version, doc_json, created_at, updated_at)
             VALUES (?1, 0, '{}', ?2, ?2)",
            params![Status::Received.as_str(), now],
        )?;
        let id = tx.last_insert_rowid();
        let submission = Submission::new(id, request.to_string());
        tx.execute(
            "UPDATE submissions SET doc_json = ?1, created_at = ?2, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&submission)?,
                submission.created_at.to_rfc3339(),
                id
            ],
        )?;
        tx.commit()?;
        Ok(submission)
    }

    pub fn get_submission(&self, id: i64) -> Result<Option<Submission>, StoreError> {
        let db = self.db.lock();
        let row = db
            .query_row(
                "SELECT doc_json, version FROM submissions WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;
        row.map(|(doc, version)| decode_submission(&doc, version))
            .transpose()
    }

    /// All submissions, oldest first.
    pub fn list_submissions(&self) -> Result<Vec<Submission>, StoreError> {
        self.query_submissions("SELECT doc_json, version FROM submissions ORDER BY id ASC", [])
    }

    /// Submissions currently in any of the given states, oldest first.
    pub fn list_by_status(&self, statuses: &[Status]) -> Result<Vec<Submission>, StoreError> {
        let mut all = Vec::new();
        for status in statuses {
            all.extend(self.query_submissions(
                "SELECT doc_json, version FROM submissions WHERE status = ?1 ORDER BY id ASC",
                params![status.as_str()],
            )?);
        }
        all.sort_by_key(|s| s.id);
        Ok(all)
    }

    /// Most recent submissions, newest first.
    pub fn recent_submissions(&self, limit: usize) -> Result<Vec<Submission>, StoreError> {
        self.query_submissions(
            "SELECT doc_json, version FROM submissions ORDER BY id DESC LIMIT ?1",
            params![limit as i64],
        )
    }

    fn query_submissions<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<Submission>, StoreError> {
        let db = self.db.lock();
        let mut stmt = db.prepare(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|(doc, version)| decode_submission(doc, *version))
            .collect()
    }

    /// Compare-and-swap write. Succeeds only if the stored version still
    /// equals `submission.version`; returns the record with its new version.
    pub fn save(&self, submission: &Submission) -> Result<Submission, StoreError> {
        let mut next = submission.clone();
        next.version = submission.version + 1;
        let doc = serde_json::to_string(&next)?;

        let db = self.db.lock();
        let changed = db.execute(
            "UPDATE submissions
             SET status = ?1, version = ?2, doc_json = ?3, updated_at = ?4
             WHERE id = ?5 AND version = ?6",
            params![
                next.status.as_str(),
                next.version as i64,
                doc,
                next.updated_at.to_rfc3339(),
                next.id,
                submission.version as i64
            ],
        )?;
        if changed == 1 {
            return Ok(next);
        }

        let exists: bool = db
            .query_row(
                "SELECT 1 FROM submissions WHERE id = ?1",
                params![submission.id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            Err(StoreError::Conflict(submission.id))
        } else {
            Err(StoreError::NotFound(submission.id))
        }
    }

    /// Read-modify-write with CAS retries. The closure may veto the write by
    /// returning an error, which is passed through unchanged.
    pub fn update<F>(&self, id: i64, mut apply: F) -> Result<Submission, StoreError>
    where
        F: FnMut(&mut Submission) -> Result<(), StoreError>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut current = self.get_submission(id)?.ok_or(StoreError::NotFound(id))?;
            apply(&mut current)?;
            match self.save(&current) {
                Err(StoreError::Conflict(_)) => continue,
                other => return other,
            }
        }
        Err(StoreError::Conflict(id))
    }

    /// Cancel a non-terminal submission, whichever stage currently owns it.
    pub fn cancel(&self, id: i64) -> Result<Submission, StoreError> {
        self.update(id, |submission| {
            if submission.status.is_terminal() {
                return Err(StoreError::NotCancellable {
                    id,
                    status: submission.status,
                });
            }
            submission.status = Status::Cancelled;
            submission.error = Some(CANCELLED_ERROR.to_string());
            submission.updated_at = Utc::now();
            Ok(())
        })
    }

    // ── Released features ──────────────────────────────────────────────

    /// Insert or replace a feature by id. Returns the record it replaced,
    /// read in the same transaction as the write.
    pub fn upsert_feature(
        &self,
        feature: &ReleasedFeature,
    ) -> Result<Option<ReleasedFeature>, StoreError> {
        let mut db = self.db.lock();
        let tx = db.transaction()?;
        let previous: Option<ReleasedFeature> = tx
            .query_row(
                "SELECT doc_json FROM released_features WHERE id = ?1",
                params![feature.id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .map(|d| serde_json::from_str(&d))
            .transpose()?;
        tx.execute(
            "INSERT INTO released_features (id, feature_file, doc_json, released_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                feature_file = excluded.feature_file,
                doc_json = excluded.doc_json,
                released_at = excluded.released_at",
            params![
                feature.id,
                feature.feature_file,
                serde_json::to_string(feature)?,
                feature.released_at.to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(previous)
    }

    pub fn remove_feature(&self, id: i64) -> Result<bool, StoreError> {
        let db = self.db.lock();
        let changed = db.execute("DELETE FROM released_features WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Undo an [`upsert_feature`](Self::upsert_feature): restore the record
    /// it replaced, or delete the row if it was a fresh insert.
    pub fn rollback_feature(
        &self,
        id: i64,
        previous: Option<&ReleasedFeature>,
    ) -> Result<(), StoreError> {
        match previous {
            Some(feature) => {
                self.upsert_feature(feature)?;
            }
            None => {
                self.remove_feature(id)?;
            }
        }
        Ok(())
    }

    pub fn get_feature(&self, id: i64) -> Result<Option<ReleasedFeature>, StoreError> {
        let db = self.db.lock();
        let doc = db
            .query_row(
                "SELECT doc_json FROM released_features WHERE id = ?1",
                params![id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(doc.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    pub fn get_feature_by_file(&self, file: &str) -> Result<Option<ReleasedFeature>, StoreError> {
        let db = self.db.lock();
        let doc = db
            .query_row(
                "SELECT doc_json FROM released_features WHERE feature_file = ?1",
                params![file],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(doc.map(|d| serde_json::from_str(&d)).transpose()?)
    }

    /// All released features, in id order.
    pub fn list_features(&self) -> Result<Vec<ReleasedFeature>, StoreError> {
        let db = self.db.lock();
        let mut stmt = db.prepare("SELECT doc_json FROM released_features ORDER BY id ASC")?;
        let docs = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        docs.iter()
            .map(|d| serde_json::from_str(d).map_err(StoreError::from))
            .collect()
    }

    // ── Snapshots ──────────────────────────────────────────────────────

    /// Write both collections as pretty JSON under `root`. Returns the
    /// root-relative paths written.
    pub fn export_snapshot(&self, root: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let submissions = serde_json::to_string_pretty(&self.list_submissions()?)?;
        let features = serde_json::to_string_pretty(&self.list_features()?)?;

        let mut written = Vec::with_capacity(2);
        for (rel, body) in [(SUBMISSIONS_SNAPSHOT, submissions), (FEATURES_SNAPSHOT, features)] {
            let full = root.join(rel);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&full, body)?;
            written.push(PathBuf::from(rel));
        }
        Ok(written)
    }
}

fn decode_submission(doc: &str, version: i64) -> Result<Submission, StoreError> {
    let mut submission: Submission = serde_json::from_str(doc)?;
    // The column is authoritative; the document copy can lag a failed write.
    submission.version = version as u64;
    Ok(submission)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(id: i64, module_type: &str) -> ReleasedFeature {
        ReleasedFeature {
            id,
            module_type: module_type.to_string(),
            request: "add a todo list".to_string(),
            feature_file: format!("feature-{id}.js"),
            used_ai: true,
            released_at: Utc::now(),
        }
    }

    #[test]
    fn ids_are_monotonic() {
        let store = Store::open_memory().unwrap();
        let a = store.create_submission("add a todo list").unwrap();
        let b = store.create_submission("add a counter").unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.status, Status::Received);

        let loaded = store.get_submission(a.id).unwrap().unwrap();
        assert_eq!(loaded.request, "add a todo list");
        assert_eq!(loaded.version, 0);
    }

    #[test]
    fn version_lives_in_the_row_only() {
        let store = Store::open_memory().unwrap();
        let sub = store.create_submission("add a timer").unwrap();
        let saved = store
            .update(sub.id, |s| {
                s.advance(Status::Reviewing);
                Ok(())
            })
            .unwrap();
        assert_eq!(saved.version, 1);

        let json = serde_json::to_value(&saved).unwrap();
        assert!(json.get("version").is_none());
        assert_eq!(store.get_submission(sub.id).unwrap().unwrap().version, 1);
    }

    #[test]
    fn save_bumps_version_and_detects_conflict() {
        let store = Store::open_memory().unwrap();
        let sub = store.create_submission("add a timer").unwrap();

        let mut first = sub.clone();
        first.advance(Status::Reviewing);
        let saved = store.save(&first).unwrap();
        assert_eq!(saved.version, 1);

        // A writer still holding version 0 loses.
        let mut stale = sub.clone();
        stale.advance(Status::Approved);
        assert!(matches!(store.save(&stale), Err(StoreError::Conflict(_))));

        let loaded = store.get_submission(sub.id).unwrap().unwrap();
        assert_eq!(loaded.status, Status::Reviewing);
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn save_unknown_id_is_not_found() {
        let store = Store::open_memory().unwrap();
        let ghost = Submission::new(42, "nothing".into());
        assert!(matches!(store.save(&ghost), Err(StoreError::NotFound(42))));
    }

    #[test]
    fn list_by_status_filters() {
        let store = Store::open_memory().unwrap();
        let a = store.create_submission("one").unwrap();
        let b = store.create_submission("two").unwrap();
        store
            .update(b.id, |s| {
                s.advance(Status::Approved);
                Ok(())
            })
            .unwrap();

        let received = store.list_by_status(&[Status::Received]).unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, a.id);

        let both = store
            .list_by_status(&[Status::Approved, Status::Received])
            .unwrap();
        assert_eq!(both.iter().map(|s| s.id).collect::<Vec<_>>(), vec![a.id, b.id]);
    }

    #[test]
    fn cancel_only_non_terminal() {
        let store = Store::open_memory().unwrap();
        let sub = store.create_submission("add a note").unwrap();
        let cancelled = store.cancel(sub.id).unwrap();
        assert_eq!(cancelled.status, Status::Cancelled);
        assert_eq!(cancelled.error.as_deref(), Some(CANCELLED_ERROR));

        let again = store.cancel(sub.id);
        assert!(matches!(
            again,
            Err(StoreError::NotCancellable {
                status: Status::Cancelled,
                ..
            })
        ));
        assert!(matches!(store.cancel(999), Err(StoreError::NotFound(999))));
    }

    #[test]
    fn upsert_replaces_and_rollback_restores() {
        let store = Store::open_memory().unwrap();
        assert_eq!(store.upsert_feature(&feature(3, "todo-3")).unwrap(), None);

        let previous = store.upsert_feature(&feature(3, "todo-3b")).unwrap();
        assert_eq!(previous.as_ref().unwrap().module_type, "todo-3");
        assert_eq!(store.list_features().unwrap().len(), 1);

        store.rollback_feature(3, previous.as_ref()).unwrap();
        assert_eq!(store.get_feature(3).unwrap().unwrap().module_type, "todo-3");

        store.rollback_feature(3, None).unwrap();
        assert!(store.get_feature(3).unwrap().is_none());
    }

    #[test]
    fn concurrent_upserts_each_see_a_distinct_previous() {
        let store = std::sync::Arc::new(Store::open_memory().unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .upsert_feature(&feature(7, &format!("note-{i}")))
                        .unwrap()
                        .map(|f| f.module_type)
                })
            })
            .collect();
        let mut previous: Vec<Option<String>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        // Writes are serialised: exactly one saw an empty slot, and no two
        // writers replaced the same record.
        assert_eq!(previous.iter().filter(|p| p.is_none()).count(), 1);
        previous.sort();
        previous.dedup();
        assert_eq!(previous.len(), 8);
    }

    #[test]
    fn feature_lookup_by_file() {
        let store = Store::open_memory().unwrap();
        store.upsert_feature(&feature(5, "counter-5")).unwrap();
        let found = store.get_feature_by_file("feature-5.js").unwrap().unwrap();
        assert_eq!(found.id, 5);
        assert!(store.get_feature_by_file("feature-6.js").unwrap().is_none());
    }

    #[test]
    fn snapshot_writes_both_collections() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_memory().unwrap();
        store.create_submission("add a todo list").unwrap();
        store.upsert_feature(&feature(1, "todo-1")).unwrap();

        let written = store.export_snapshot(dir.path()).unwrap();
        assert_eq!(written.len(), 2);

        let subs: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(SUBMISSIONS_SNAPSHOT)).unwrap(),
        )
        .unwrap();
        assert_eq!(subs.as_array().unwrap().len(), 1);
        let feats: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(FEATURES_SNAPSHOT)).unwrap(),
        )
        .unwrap();
        assert_eq!(feats[0]["moduleType"], "todo-1");
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("covibe.db");
        let id = {
            let store = Store::open(&path).unwrap();
            store.create_submission("add a picker").unwrap().id
        };
        let store = Store::open(&path).unwrap();
        assert_eq!(store.get_submission(id).unwrap().unwrap().request, "add a picker");
    }
}
