//! SQLite-backed `PipelineStore`.
//!
//! Records are stored as JSON documents next to the columns used for
//! lookups. Every operation opens its own connection on the blocking pool
//! and every mutation reads and writes inside one immediate transaction, so
//! any number of processes can share a database file: a long-running sweep
//! sees runs submitted after it started, and concurrent writers wait on the
//! busy timeout instead of overwriting each other.

use super::{PipelineStore, build_hypothesis, build_run};
use crate::error::StoreError;
use crate::types::{
    ExclusionFilter, Hypothesis, HypothesisId, HypothesisUpdate, NewHypothesis, NewRun,
    ProjectId, Resource, ResourceId, Run, RunId, RunUpdate,
};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Params, Transaction, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS resources (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    record     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS runs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    record     TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS hypotheses (
    id      INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id  INTEGER NOT NULL REFERENCES runs (id),
    ordinal INTEGER NOT NULL,
    record  TEXT NOT NULL,
    UNIQUE (run_id, ordinal)
);
";

/// How long a connection waits for another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Persistence {
            message: format!("SQLite error: {e}"),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Persistence {
            message: format!("Record encoding error: {e}"),
        }
    }
}

fn connect(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Run `f` in an immediate transaction, committing only if it succeeds.
fn write<T>(
    conn: &mut Connection,
    f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

fn load<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    id: i64,
) -> Result<Option<T>, StoreError> {
    let record: Option<String> = conn
        .query_row(sql, params![id], |row| row.get(0))
        .optional()?;
    Ok(record.map(|r| serde_json::from_str(&r)).transpose()?)
}

fn load_all<T: DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    args: impl Params,
) -> Result<Vec<T>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let records = stmt
        .query_map(args, |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    records
        .iter()
        .map(|r| serde_json::from_str(r).map_err(StoreError::from))
        .collect()
}

fn save<T: Serialize>(conn: &Connection, sql: &str, id: i64, record: &T) -> Result<(), StoreError> {
    conn.execute(sql, params![serde_json::to_string(record)?, id])?;
    Ok(())
}

const SELECT_RUN: &str = "SELECT record FROM runs WHERE id = ?1";
const SAVE_RUN: &str = "UPDATE runs SET record = ?1 WHERE id = ?2";
const SELECT_HYPOTHESIS: &str = "SELECT record FROM hypotheses WHERE id = ?1";
const SAVE_HYPOTHESIS: &str = "UPDATE hypotheses SET record = ?1 WHERE id = ?2";

/// Durable store in a single SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Open the database at `path`, creating the file and its tables if
    /// needed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Persistence {
                message: format!("Failed to create {}: {e}", parent.display()),
            })?;
        }
        connect(&path)?.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "Opened SQLite store");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = connect(&path)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Persistence {
            message: format!("Store task failed: {e}"),
        })?
    }

    pub async fn create_resource(
        &self,
        project_id: ProjectId,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<Resource, StoreError> {
        let (name, content) = (name.into(), content.into());
        self.with_conn(move |conn| {
            write(conn, |tx| {
                tx.execute(
                    "INSERT INTO resources (project_id, record) VALUES (?1, '{}')",
                    params![project_id],
                )?;
                let resource = Resource {
                    id: tx.last_insert_rowid(),
                    project_id,
                    name,
                    content,
                };
                save(
                    tx,
                    "UPDATE resources SET record = ?1 WHERE id = ?2",
                    resource.id,
                    &resource,
                )?;
                Ok(resource)
            })
        })
        .await
    }

    /// Create a pending run, as the submission layer does.
    pub async fn create_run(&self, new: NewRun) -> Result<Run, StoreError> {
        self.with_conn(move |conn| {
            write(conn, |tx| {
                tx.execute(
                    "INSERT INTO runs (project_id, record) VALUES (?1, '{}')",
                    params![new.project_id],
                )?;
                let run = build_run(tx.last_insert_rowid(), new, Utc::now());
                save(tx, SAVE_RUN, run.id, &run)?;
                Ok(run)
            })
        })
        .await
    }
}

#[async_trait]
impl PipelineStore for SqliteStore {
    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        self.with_conn(move |conn| load(conn, SELECT_RUN, run_id))
            .await
    }

    async fn get_resource(&self, id: ResourceId) -> Result<Option<Resource>, StoreError> {
        self.with_conn(move |conn| load(conn, "SELECT record FROM resources WHERE id = ?1", id))
            .await
    }

    async fn update_run_status(&self, run_id: RunId, update: RunUpdate) -> Result<Run, StoreError> {
        self.with_conn(move |conn| {
            write(conn, |tx| {
                let mut run: Run =
                    load(tx, SELECT_RUN, run_id)?.ok_or(StoreError::RunNotFound { run_id })?;
                update.apply(&mut run, Utc::now());
                save(tx, SAVE_RUN, run_id, &run)?;
                Ok(run)
            })
        })
        .await
    }

    async fn create_hypotheses(
        &self,
        batch: Vec<NewHypothesis>,
    ) -> Result<Vec<Hypothesis>, StoreError> {
        self.with_conn(move |conn| {
            write(conn, |tx| {
                let now = Utc::now();
                let mut created = Vec::with_capacity(batch.len());
                for new in batch {
                    let exists: bool = tx.query_row(
                        "SELECT EXISTS (SELECT 1 FROM runs WHERE id = ?1)",
                        params![new.run_id],
                        |row| row.get(0),
                    )?;
                    if !exists {
                        return Err(StoreError::RunNotFound { run_id: new.run_id });
                    }
                    tx.execute(
                        "INSERT INTO hypotheses (run_id, ordinal, record) VALUES (?1, ?2, '{}')",
                        params![new.run_id, new.ordinal],
                    )?;
                    let hypothesis = build_hypothesis(tx.last_insert_rowid(), new, now);
                    save(tx, SAVE_HYPOTHESIS, hypothesis.id, &hypothesis)?;
                    created.push(hypothesis);
                }
                Ok(created)
            })
        })
        .await
    }

    async fn get_hypothesis(&self, id: HypothesisId) -> Result<Option<Hypothesis>, StoreError> {
        self.with_conn(move |conn| load(conn, SELECT_HYPOTHESIS, id))
            .await
    }

    async fn update_hypothesis(
        &self,
        id: HypothesisId,
        update: HypothesisUpdate,
    ) -> Result<Hypothesis, StoreError> {
        self.with_conn(move |conn| {
            write(conn, |tx| {
                let mut hypothesis: Hypothesis = load(tx, SELECT_HYPOTHESIS, id)?
                    .ok_or(StoreError::HypothesisNotFound { id })?;
                update.apply(&mut hypothesis, Utc::now());
                save(tx, SAVE_HYPOTHESIS, id, &hypothesis)?;
                Ok(hypothesis)
            })
        })
        .await
    }

    async fn get_hypotheses_for_run(&self, run_id: RunId) -> Result<Vec<Hypothesis>, StoreError> {
        self.with_conn(move |conn| {
            load_all(
                conn,
                "SELECT record FROM hypotheses WHERE run_id = ?1 ORDER BY ordinal, id",
                params![run_id],
            )
        })
        .await
    }

    async fn get_existing_hypotheses(
        &self,
        project_id: ProjectId,
        filter: &ExclusionFilter,
    ) -> Result<Vec<Hypothesis>, StoreError> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let found: Vec<Hypothesis> = load_all(
                conn,
                "SELECT h.record FROM hypotheses h JOIN runs r ON r.id = h.run_id \
                 WHERE r.project_id = ?1 ORDER BY h.run_id, h.ordinal",
                params![project_id],
            )?;
            Ok(found.into_iter().filter(|h| filter.matches(h)).collect())
        })
        .await
    }

    async fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
        self.with_conn(|conn| load_all(conn, "SELECT record FROM runs ORDER BY id", params![]))
            .await
    }
}
