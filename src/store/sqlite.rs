//! [`Store`] backed by an SQLite database shared by several worker processes.
//!
//! The columns queried by the job queue (`alive`, `last_fit`,
//! `classification`) live in their own columns; the complete extras record is
//! kept as JSON next to them and the columns win when a row is read back.
//!
//! Claims run inside a `BEGIN IMMEDIATE` transaction, which takes the database
//! write lock up front: a concurrent worker waits (up to the busy timeout)
//! instead of reading the same candidate. The claim itself is a
//! compare-and-swap on `last_fit`, so a row modified since it was selected is
//! never claimed twice.
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use camino::Utf8Path;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use crate::constants::{Degree, JulianDate};
use crate::mop_errors::MopError;
use crate::store::{window_days, DataType, Datum, DatumValue, Store};
use crate::target::{Target, TargetExtras, TargetFilter, TargetKind};

const SCHEMA_VERSION: i64 = 1;
const CLAIM_ATTEMPTS: usize = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS targets (
    name           TEXT PRIMARY KEY,
    ra             REAL NOT NULL,
    dec            REAL NOT NULL,
    kind           TEXT NOT NULL,
    epoch          REAL NOT NULL,
    classification TEXT,
    alive          INTEGER,
    last_fit       REAL,
    extras         TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS targets_claim ON targets (alive, last_fit);
CREATE TABLE IF NOT EXISTS data (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    target    TEXT NOT NULL REFERENCES targets (name),
    source    TEXT NOT NULL,
    data_type TEXT NOT NULL,
    timestamp REAL NOT NULL,
    value     TEXT NOT NULL,
    UNIQUE (target, source, data_type, timestamp)
);
";

const TARGET_COLUMNS: &str = "name, ra, dec, kind, epoch, classification, alive, last_fit, extras";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (and migrate) the database at `path`.
    pub fn open(path: &Utf8Path) -> Result<Self, MopError> {
        SqliteStore::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, MopError> {
        SqliteStore::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, MopError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn migrate(&self) -> Result<(), MopError> {
        let conn = self.conn();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(MopError::InvalidConfig(format!(
                "database schema version {version} is newer than supported ({SCHEMA_VERSION})"
            )));
        }
        if version < 1 {
            conn.execute_batch(SCHEMA)?;
            conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))?;
        }
        Ok(())
    }
}

/// Raw row of the `targets` table; decoding the JSON happens outside rusqlite's closure.
struct TargetRow {
    name: String,
    ra: f64,
    dec: f64,
    kind: String,
    epoch: f64,
    classification: Option<String>,
    alive: Option<bool>,
    last_fit: Option<f64>,
    extras: String,
}

impl TargetRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(TargetRow {
            name: row.get(0)?,
            ra: row.get(1)?,
            dec: row.get(2)?,
            kind: row.get(3)?,
            epoch: row.get(4)?,
            classification: row.get(5)?,
            alive: row.get(6)?,
            last_fit: row.get(7)?,
            extras: row.get(8)?,
        })
    }

    fn into_target(self) -> Result<Target, MopError> {
        let mut extras: TargetExtras = serde_json::from_str(&self.extras)?;
        extras.classification = self.classification;
        extras.alive = self.alive;
        extras.last_fit = self.last_fit;
        Ok(Target {
            kind: self.kind.parse()?,
            name: self.name,
            ra: self.ra,
            dec: self.dec,
            epoch: self.epoch,
            extras,
        })
    }
}

fn select_target(conn: &Connection, name: &str) -> Result<Option<Target>, MopError> {
    conn.query_row(
        &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE name = ?1"),
        [name],
        TargetRow::from_row,
    )
    .optional()?
    .map(TargetRow::into_target)
    .transpose()
}

fn target_exists(conn: &Connection, name: &str) -> Result<bool, MopError> {
    Ok(conn
        .query_row("SELECT 1 FROM targets WHERE name = ?1", [name], |_| Ok(()))
        .optional()?
        .is_some())
}

impl Store for SqliteStore {
    fn find(&self, filter: &TargetFilter) -> Result<Vec<Target>, MopError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TARGET_COLUMNS} FROM targets
             WHERE (?1 IS NULL OR name = ?1)
               AND (?2 IS NULL OR classification = ?2)
             ORDER BY name"
        ))?;
        let rows = stmt
            .query_map(params![filter.name, filter.classification], TargetRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        // alive and missing_last_fit have three-valued semantics; filter in Rust
        let mut targets = Vec::with_capacity(rows.len());
        for row in rows {
            let target = row.into_target()?;
            if filter.matches(&target) {
                targets.push(target);
            }
        }
        Ok(targets)
    }

    fn get(&self, name: &str) -> Result<Target, MopError> {
        select_target(&self.conn(), name)?.ok_or_else(|| MopError::TargetNotFound(name.to_string()))
    }

    fn get_or_create(
        &self,
        name: &str,
        ra: Degree,
        dec: Degree,
        kind: TargetKind,
        epoch: f64,
    ) -> Result<(Target, bool), MopError> {
        let conn = self.conn();
        let created = conn.execute(
            "INSERT INTO targets (name, ra, dec, kind, epoch) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (name) DO NOTHING",
            params![name, ra, dec, kind.to_string(), epoch],
        )? > 0;
        let target = select_target(&conn, name)?.ok_or_else(|| MopError::TargetNotFound(name.to_string()))?;
        Ok((target, created))
    }

    fn claim_stale(&self, window_hours: f64, now: JulianDate) -> Result<Option<Target>, MopError> {
        let mut conn = self.conn();
        // dropping the transaction on any early return rolls it back
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let window = window_days(window_hours);

        for _ in 0..CLAIM_ATTEMPTS {
            let candidate: Option<(String, f64)> = tx
                .query_row(
                    "SELECT name, last_fit FROM targets
                     WHERE alive = 1 AND last_fit IS NOT NULL AND (?1 - last_fit) >= ?2
                     ORDER BY last_fit ASC, name ASC
                     LIMIT 1",
                    params![now, window],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((name, last_fit)) = candidate else {
                return Ok(None);
            };

            let changes = tx.execute(
                "UPDATE targets SET last_fit = ?1 WHERE name = ?2 AND last_fit = ?3",
                params![now, name, last_fit],
            )?;
            if changes == 0 {
                debug!(event = %name, "claim lost, retrying");
                continue;
            }

            let claimed = select_target(&tx, &name)?;
            tx.commit()?;
            return Ok(claimed);
        }

        Err(MopError::StoreConflict(format!(
            "no claim after {CLAIM_ATTEMPTS} attempts"
        )))
    }

    fn save_extras(&self, name: &str, extras: &TargetExtras) -> Result<(), MopError> {
        let json = serde_json::to_string(extras)?;
        let changes = self.conn().execute(
            "UPDATE targets SET classification = ?2, alive = ?3, last_fit = ?4, extras = ?5
             WHERE name = ?1",
            params![name, extras.classification, extras.alive, extras.last_fit, json],
        )?;
        if changes == 0 {
            return Err(MopError::TargetNotFound(name.to_string()));
        }
        Ok(())
    }

    fn append_datum(&self, datum: Datum) -> Result<(), MopError> {
        let value = serde_json::to_string(&datum.value)?;
        let conn = self.conn();
        if !target_exists(&conn, &datum.target)? {
            return Err(MopError::TargetNotFound(datum.target));
        }
        let inserted = conn.execute(
            "INSERT INTO data (target, source, data_type, timestamp, value)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (target, source, data_type, timestamp) DO NOTHING",
            params![
                datum.target,
                datum.source,
                datum.data_type().as_str(),
                datum.timestamp,
                value
            ],
        )?;
        if inserted == 0 {
            return Err(datum.duplicate_error());
        }
        Ok(())
    }

    fn data(&self, name: &str, data_type: Option<DataType>) -> Result<Vec<Datum>, MopError> {
        let conn = self.conn();
        if !target_exists(&conn, name)? {
            return Err(MopError::TargetNotFound(name.to_string()));
        }
        let mut stmt = conn.prepare(
            "SELECT source, timestamp, value FROM data
             WHERE target = ?1 AND (?2 IS NULL OR data_type = ?2)
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![name, data_type.map(|dt| dt.as_str())], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(source, timestamp, value)| {
                let value: DatumValue = serde_json::from_str(&value)?;
                Ok(Datum::new(name, &source, timestamp, value))
            })
            .collect()
    }
}

#[cfg(test)]
mod sqlite_test {
    use super::*;
    use crate::photometry::PhotometryPoint;
    use crate::target::CovarianceMatrix;

    #[test]
    fn test_extras_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (mut target, created) = store
            .get_or_create("OGLE-2024-BLG-0001", 268.1, -29.2, TargetKind::Sidereal, 2000.0)
            .unwrap();
        assert!(created);

        target.extras.classification = Some("Microlensing".into());
        target.extras.alive = Some(true);
        target.extras.last_fit = Some(2446756.5);
        target.extras.fit_covariance = Some(CovarianceMatrix(vec![
            vec![0.1 + 0.2, 1e-17, -3.3333333333333335],
            vec![1e-17, 2.0 / 3.0, 0.0],
            vec![-3.3333333333333335, 0.0, 7.1e300],
        ]));
        store.save_extras(&target.name, &target.extras).unwrap();

        let back = store.get(&target.name).unwrap();
        assert_eq!(back, target);
        assert_eq!(store.find(&TargetFilter::alive()).unwrap().len(), 1);
        assert_eq!(
            store.save_extras("missing", &TargetExtras::default()),
            Err(MopError::TargetNotFound("missing".into()))
        );
    }

    #[test]
    fn test_claim_stale() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = 2459000.0;
        for (name, age) in [("a", 0.1), ("b", 1.0), ("c", 2.0)] {
            let (mut t, _) = store
                .get_or_create(name, 0.0, 0.0, TargetKind::Sidereal, 2000.0)
                .unwrap();
            t.extras.alive = Some(name != "c");
            t.extras.last_fit = Some(now - age);
            store.save_extras(name, &t.extras).unwrap();
        }

        let claimed = store.claim_stale(4.0, now).unwrap().unwrap();
        assert_eq!(claimed.name, "b");
        assert_eq!(claimed.extras.last_fit, Some(now));
        // "a" is too fresh and "c" is dead
        assert_eq!(store.claim_stale(4.0, now).unwrap(), None);
    }

    #[test]
    fn test_data_order_and_duplicates() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .get_or_create("ev", 0.0, 0.0, TargetKind::Sidereal, 2000.0)
            .unwrap();
        for jd in [2459002.0, 2459001.0] {
            let p = PhotometryPoint::new(jd, 18.0, 0.01, "I");
            store.append_datum(Datum::photometry("ev", "OGLE", &p)).unwrap();
        }
        let p = PhotometryPoint::new(2459001.0, 17.0, 0.01, "I");
        assert!(matches!(
            store.append_datum(Datum::photometry("ev", "OGLE", &p)),
            Err(MopError::DuplicateDatum { .. })
        ));

        let data = store.data("ev", Some(DataType::Photometry)).unwrap();
        assert_eq!(data.len(), 2);
        assert!(data[0].timestamp < data[1].timestamp);
        assert!(store.data("ev", Some(DataType::LightCurveModel)).unwrap().is_empty());
        assert_eq!(store.photometry("ev").unwrap()[0].len(), 2);
    }
}
