//! SQLite backend.
//!
//! The logical schema is provisioned with `CREATE TABLE IF NOT EXISTS` on
//! open, so opening an existing database never touches its rows. Lineage
//! rows for a new slice are copied from the parent's rows in a single
//! `INSERT ... SELECT`, and visibility is answered by one ordered join over
//! `AncestorLineage`.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use strata_types::{AttributeKey, DataRow, ObjectKey, ObjectRow, Slice, SliceId, Value};

use crate::error::{StoreError, StoreResult};
use crate::traits::Backend;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS Objects (
      id INTEGER PRIMARY KEY,
      type TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS Slices (
      id INTEGER PRIMARY KEY,
      parent_slice_id INTEGER REFERENCES Slices(id)
    );

    CREATE TABLE IF NOT EXISTS AncestorLineage (
      child_slice_id INTEGER NOT NULL,
      ancestor_slice_id INTEGER NOT NULL,
      PRIMARY KEY (child_slice_id, ancestor_slice_id)
    );

    CREATE TABLE IF NOT EXISTS Data (
      seq INTEGER PRIMARY KEY,
      object_id INTEGER NOT NULL,
      attribute_key INTEGER NOT NULL,
      value TEXT NOT NULL,
      slice_id INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS StagingData (
      seq INTEGER PRIMARY KEY,
      object_id INTEGER NOT NULL,
      attribute_key INTEGER NOT NULL,
      value TEXT NOT NULL,
      slice_id INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_objects_type ON Objects(type);
    CREATE INDEX IF NOT EXISTS idx_data_object ON Data(object_id, attribute_key, slice_id);
    CREATE INDEX IF NOT EXISTS idx_data_slice ON Data(slice_id);
"#;

const SELECT_VISIBLE: &str = "
    SELECT d.seq, d.object_id, d.attribute_key, d.value, d.slice_id
    FROM Data d
    JOIN AncestorLineage l ON d.slice_id = l.ancestor_slice_id
    WHERE l.child_slice_id = ?1 AND d.object_id = ?2 AND d.attribute_key = ?3
    ORDER BY d.slice_id DESC, d.seq DESC
    LIMIT 1
";

const SELECT_VISIBLE_FOR_OBJECT: &str = "
    SELECT seq, object_id, attribute_key, value, slice_id FROM (
      SELECT d.seq, d.object_id, d.attribute_key, d.value, d.slice_id,
             ROW_NUMBER() OVER (
               PARTITION BY d.attribute_key
               ORDER BY d.slice_id DESC, d.seq DESC
             ) AS pos
      FROM Data d
      JOIN AncestorLineage l ON d.slice_id = l.ancestor_slice_id
      WHERE l.child_slice_id = ?1 AND d.object_id = ?2
    )
    WHERE pos = 1
    ORDER BY attribute_key
";

/// Backend over a single SQLite connection.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    /// Open (or create) a database file and provision the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(&path)?;
        let backend = Self {
            conn,
            path: Some(path),
        };
        backend.migrate()?;
        info!(path = ?backend.path, "opened sqlite store");
        Ok(backend)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let backend = Self { conn, path: None };
        backend.migrate()?;
        Ok(backend)
    }

    /// Path of the database file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn migrate(&self) -> StoreResult<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    fn slice_exists(&self, id: SliceId) -> StoreResult<bool> {
        let Some(raw) = stored(id.get()) else {
            return Ok(false);
        };
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM Slices WHERE id = ?1",
                params![raw],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

impl Backend for SqliteBackend {
    fn begin(&mut self) -> StoreResult<()> {
        if !self.conn.is_autocommit() {
            return Err(StoreError::TransactionActive);
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> StoreResult<()> {
        if self.conn.is_autocommit() {
            return Err(StoreError::NoTransaction);
        }
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> StoreResult<()> {
        if self.conn.is_autocommit() {
            return Err(StoreError::NoTransaction);
        }
        self.conn.execute_batch("ROLLBACK")?;
        debug!("rolled back sqlite transaction");
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    fn insert_object(&mut self, row: &ObjectRow) -> StoreResult<()> {
        if self.select_object(row.key)?.is_some() {
            return Err(StoreError::DuplicateObject(row.key));
        }
        self.conn.execute(
            "INSERT INTO Objects (id, type) VALUES (?1, ?2)",
            params![sql_int(row.key.get())?, row.type_name],
        )?;
        Ok(())
    }

    fn select_object(&self, key: ObjectKey) -> StoreResult<Option<ObjectRow>> {
        let Some(raw) = stored(key.get()) else {
            return Ok(None);
        };
        let row = self
            .conn
            .query_row(
                "SELECT id, type FROM Objects WHERE id = ?1",
                params![raw],
                object_from_row,
            )
            .optional()?;
        Ok(row)
    }

    fn select_objects_by_type(&self, type_name: &str) -> StoreResult<Vec<ObjectRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, type FROM Objects WHERE type = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![type_name], object_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn delete_object(&mut self, key: ObjectKey) -> StoreResult<bool> {
        let Some(id) = stored(key.get()) else {
            return Ok(false);
        };
        self.conn
            .execute("DELETE FROM Data WHERE object_id = ?1", params![id])?;
        self.conn
            .execute("DELETE FROM StagingData WHERE object_id = ?1", params![id])?;
        let deleted = self
            .conn
            .execute("DELETE FROM Objects WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    fn max_object_key(&self) -> StoreResult<Option<ObjectKey>> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM Objects", [], |row| row.get(0))?;
        Ok(max.map(|raw| ObjectKey::new(raw as u64)))
    }

    fn insert_slice(&mut self, parent: Option<SliceId>) -> StoreResult<Slice> {
        if let Some(parent) = parent {
            if !self.slice_exists(parent)? {
                return Err(StoreError::UnknownSlice(parent));
            }
        }
        let parent_raw = parent.map(|p| sql_int(p.get())).transpose()?;
        self.conn.execute(
            "INSERT INTO Slices (id, parent_slice_id) VALUES (NULL, ?1)",
            params![parent_raw],
        )?;
        let raw_id = self.conn.last_insert_rowid();
        self.conn.execute(
            "INSERT INTO AncestorLineage (child_slice_id, ancestor_slice_id) VALUES (?1, ?1)",
            params![raw_id],
        )?;
        if let Some(parent_raw) = parent_raw {
            self.conn.execute(
                "INSERT INTO AncestorLineage (child_slice_id, ancestor_slice_id)
                 SELECT ?1, ancestor_slice_id FROM AncestorLineage WHERE child_slice_id = ?2",
                params![raw_id, parent_raw],
            )?;
        }
        Ok(Slice {
            id: SliceId::new(raw_id as u64),
            parent,
        })
    }

    fn select_slice(&self, id: SliceId) -> StoreResult<Option<Slice>> {
        let Some(raw) = stored(id.get()) else {
            return Ok(None);
        };
        let slice = self
            .conn
            .query_row(
                "SELECT id, parent_slice_id FROM Slices WHERE id = ?1",
                params![raw],
                slice_from_row,
            )
            .optional()?;
        Ok(slice)
    }

    fn select_slices(&self) -> StoreResult<Vec<Slice>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, parent_slice_id FROM Slices ORDER BY id ASC")?;
        let rows = stmt.query_map([], slice_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn lineage(&self, slice: SliceId) -> StoreResult<Vec<SliceId>> {
        if !self.slice_exists(slice)? {
            return Err(StoreError::UnknownSlice(slice));
        }
        let mut stmt = self.conn.prepare(
            "SELECT ancestor_slice_id FROM AncestorLineage
             WHERE child_slice_id = ?1 ORDER BY ancestor_slice_id DESC",
        )?;
        let rows = stmt.query_map(params![sql_int(slice.get())?], |row| {
            row.get::<_, i64>(0).map(|raw| SliceId::new(raw as u64))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_staging(
        &mut self,
        object: ObjectKey,
        attribute: AttributeKey,
        value: &Value,
        slice: SliceId,
    ) -> StoreResult<()> {
        let encoded =
            serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.conn.execute(
            "INSERT INTO StagingData (object_id, attribute_key, value, slice_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                sql_int(object.get())?,
                sql_int(attribute.get())?,
                encoded,
                sql_int(slice.get())?,
            ],
        )?;
        Ok(())
    }

    fn staging_len(&self) -> StoreResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM StagingData", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn flush_staging(&mut self) -> StoreResult<usize> {
        let moved = self.conn.execute(
            "INSERT INTO Data (object_id, attribute_key, value, slice_id)
             SELECT object_id, attribute_key, value, slice_id FROM StagingData ORDER BY seq",
            [],
        )?;
        self.conn.execute("DELETE FROM StagingData", [])?;
        Ok(moved)
    }

    fn select_visible(
        &self,
        slice: SliceId,
        object: ObjectKey,
        attribute: AttributeKey,
    ) -> StoreResult<Option<DataRow>> {
        let (Some(slice), Some(object), Some(attribute)) =
            (stored(slice.get()), stored(object.get()), stored(attribute.get()))
        else {
            return Ok(None);
        };
        let raw = self
            .conn
            .query_row(
                SELECT_VISIBLE,
                params![slice, object, attribute],
                RawDataRow::from_row,
            )
            .optional()?;
        raw.map(RawDataRow::decode).transpose()
    }

    fn select_visible_for_object(
        &self,
        slice: SliceId,
        object: ObjectKey,
    ) -> StoreResult<Vec<DataRow>> {
        let (Some(slice), Some(object)) = (stored(slice.get()), stored(object.get())) else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(SELECT_VISIBLE_FOR_OBJECT)?;
        let rows = stmt.query_map(params![slice, object], RawDataRow::from_row)?;
        rows.map(|raw| raw?.decode()).collect()
    }

    fn select_written_in(&self, slice: SliceId) -> StoreResult<Vec<DataRow>> {
        let Some(slice) = stored(slice.get()) else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(
            "SELECT seq, object_id, attribute_key, value, slice_id FROM Data
             WHERE slice_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![slice], RawDataRow::from_row)?;
        rows.map(|raw| raw?.decode()).collect()
    }

    fn count_writes(&self, object: ObjectKey, attribute: AttributeKey) -> StoreResult<usize> {
        let (Some(object), Some(attribute)) = (stored(object.get()), stored(attribute.get())) else {
            return Ok(0);
        };
        let count: i64 = self.conn.query_row(
            "SELECT
               (SELECT COUNT(*) FROM Data WHERE object_id = ?1 AND attribute_key = ?2)
             + (SELECT COUNT(*) FROM StagingData WHERE object_id = ?1 AND attribute_key = ?2)",
            params![object, attribute],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn reset(&mut self) -> StoreResult<()> {
        self.conn.execute_batch(
            "DELETE FROM StagingData;
             DELETE FROM Data;
             DELETE FROM AncestorLineage;
             DELETE FROM Slices;
             DELETE FROM Objects;",
        )?;
        Ok(())
    }

    fn compact(&mut self) -> StoreResult<()> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }
}

/// SQLite integers are signed 64-bit. Identifiers above `i64::MAX` cannot be
/// stored and are rejected on write.
fn sql_int(raw: u64) -> StoreResult<i64> {
    i64::try_from(raw).map_err(|_| StoreError::KeyOutOfRange(raw))
}

/// Lookup form of [`sql_int`]: an unstorable identifier matches no row.
fn stored(raw: u64) -> Option<i64> {
    i64::try_from(raw).ok()
}

fn object_from_row(row: &Row<'_>) -> rusqlite::Result<ObjectRow> {
    let id: i64 = row.get(0)?;
    let type_name: String = row.get(1)?;
    Ok(ObjectRow::new(ObjectKey::new(id as u64), type_name))
}

fn slice_from_row(row: &Row<'_>) -> rusqlite::Result<Slice> {
    let id: i64 = row.get(0)?;
    let parent: Option<i64> = row.get(1)?;
    Ok(Slice {
        id: SliceId::new(id as u64),
        parent: parent.map(|p| SliceId::new(p as u64)),
    })
}

/// A `Data` row with its value still JSON-encoded.
struct RawDataRow {
    seq: i64,
    object: i64,
    attribute: i64,
    value: String,
    slice: i64,
}

impl RawDataRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            object: row.get(1)?,
            attribute: row.get(2)?,
            value: row.get(3)?,
            slice: row.get(4)?,
        })
    }

    fn decode(self) -> StoreResult<DataRow> {
        let value = serde_json::from_str(&self.value)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(DataRow {
            seq: self.seq as u64,
            object: ObjectKey::new(self.object as u64),
            attribute: AttributeKey::new(self.attribute as u64),
            value,
            slice: SliceId::new(self.slice as u64),
        })
    }
}
