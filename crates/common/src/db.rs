//! SQLite-backed object store
//!
//! Typed, versioned objects with ownership edges and transactional save/load.
//! Ids come from per-type monotonic pools and are never reused. Every
//! persistent mutation runs inside a transaction; on failure the transaction
//! rolls back and the in-memory object keeps its change set.

use crate::types::{Cell, ObjectId, Particle, User, Uvn};
use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Database file name inside a registry or agent root directory
pub const DB_NAME: &str = "registry.db";

/// A persistent type: table, id pool, column binding
pub trait Record: Sized + std::fmt::Debug {
    const TABLE: &'static str;
    /// Id pool name; also used in NotFound errors
    const KIND: &'static str;
    /// Persisted columns, id excluded
    const COLUMNS: &'static [&'static str];

    fn id(&self) -> ObjectId;
    fn set_id(&mut self, id: ObjectId);
    fn is_changed(&self) -> bool;
    fn mark_saved(&mut self);
    fn set_readonly(&mut self, readonly: bool);
    /// Values for `COLUMNS`, in order
    fn bind(&self) -> Result<Vec<Value>>;
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;
}

/// A record owned through an `owner_id` column on its own row
pub trait Ownable: Record {
    fn owner_id(&self) -> Option<ObjectId>;
    fn set_owner_id(&mut self, owner: Option<ObjectId>);
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_value<T: serde::Serialize>(val: &T) -> Result<Value> {
    Ok(Value::Text(serde_json::to_string(val)?))
}

/// Database wrapper for registry and agent state
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    readonly: bool,
}

impl Database {
    /// Open or create the database under a root directory
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        let path = root.as_ref().join(DB_NAME);
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.clone()),
            readonly: false,
        };
        db.init_schema()?;
        info!("Opened database at {:?}", path);
        Ok(db)
    }

    /// Open an existing database for reading; writes are rejected
    pub fn open_readonly(root: impl AsRef<Path>) -> Result<Self> {
        let mut db = Self::open(root)?;
        db.readonly = true;
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
            readonly: false,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Expose the underlying connection for internal subsystems that manage
    /// their own tables within the shared state DB (key pools, peer state).
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    pub fn readonly(&self) -> bool {
        self.readonly
    }

    /// Path of the backing file, if file-backed
    pub fn file_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            -- Typed monotonic id pools; ids are never reused
            CREATE TABLE IF NOT EXISTS id_pool (
                pool TEXT PRIMARY KEY,
                next_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS uvns (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                address TEXT,
                settings TEXT NOT NULL
            );

            -- Ownership edge for uvns (dedicated owner table)
            CREATE TABLE IF NOT EXISTS uvns_credentials (
                uvn_id INTEGER PRIMARY KEY,
                owner_id INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cells (
                id INTEGER PRIMARY KEY,
                uvn_id INTEGER NOT NULL,
                name TEXT NOT NULL UNIQUE,
                address TEXT,
                allowed_lans TEXT NOT NULL,
                settings TEXT NOT NULL,
                excluded INTEGER NOT NULL DEFAULT 0,
                owner_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_cells_uvn ON cells(uvn_id);

            CREATE TABLE IF NOT EXISTS particles (
                id INTEGER PRIMARY KEY,
                uvn_id INTEGER NOT NULL,
                name TEXT NOT NULL UNIQUE,
                excluded INTEGER NOT NULL DEFAULT 0,
                owner_id INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_particles_uvn ON particles(uvn_id);

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                realm TEXT NOT NULL,
                password TEXT NOT NULL,
                excluded INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS registry (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                uvn_id INTEGER NOT NULL,
                deployment TEXT,
                generation_ts TEXT NOT NULL,
                rekeyed_root_config_id TEXT
            );

            CREATE TABLE IF NOT EXISTS asymm_keys (
                key_id TEXT NOT NULL,
                public TEXT NOT NULL,
                private TEXT NOT NULL,
                dropped INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (key_id, dropped)
            );

            CREATE TABLE IF NOT EXISTS symm_keys (
                key_id TEXT NOT NULL,
                value TEXT NOT NULL,
                dropped INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (key_id, dropped)
            );

            -- Last observed state of every peer, persisted by the agent
            CREATE TABLE IF NOT EXISTS peers (
                id INTEGER PRIMARY KEY,
                owner_kind TEXT NOT NULL,
                owner_id INTEGER NOT NULL,
                registry_id TEXT,
                status TEXT NOT NULL,
                ts_start TEXT,
                routed_networks TEXT NOT NULL,
                known_networks TEXT NOT NULL,
                UNIQUE (owner_kind, owner_id)
            );
            "#,
        )?;
        debug!("Database schema initialized");
        Ok(())
    }

    /// Run `f` inside a transaction; rollback on error
    pub fn transaction<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnly("database"));
        }
        Ok(())
    }

    /// Allocate the next id from a typed pool, inside a transaction
    pub fn next_id_in(tx: &Transaction<'_>, pool: &str) -> Result<ObjectId> {
        let current: Option<i64> = tx
            .query_row(
                "SELECT next_id FROM id_pool WHERE pool = ?1",
                params![pool],
                |row| row.get(0),
            )
            .optional()?;
        match current {
            Some(next) => {
                tx.execute(
                    "UPDATE id_pool SET next_id = ?1 WHERE pool = ?2",
                    params![next + 1, pool],
                )?;
                Ok(next)
            }
            None => {
                tx.execute(
                    "INSERT INTO id_pool (pool, next_id) VALUES (?1, 2)",
                    params![pool],
                )?;
                Ok(1)
            }
        }
    }

    /// Persist a record inside an open transaction
    pub fn save_in<T: Record>(tx: &Transaction<'_>, obj: &T) -> Result<()> {
        let cols = T::COLUMNS.join(", ");
        let placeholders: Vec<String> =
            (0..T::COLUMNS.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {} (id, {}) VALUES (?1, {})",
            T::TABLE,
            cols,
            placeholders.join(", ")
        );
        let mut values = vec![Value::Integer(obj.id())];
        values.extend(obj.bind()?);
        tx.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    /// Allocate a fresh id and persist a new record
    pub fn new_record<T: Record>(&self, mut obj: T) -> Result<T> {
        self.check_writable()?;
        self.transaction(|tx| {
            let id = Self::next_id_in(tx, T::KIND)?;
            obj.set_id(id);
            Self::save_in(tx, &obj)?;
            Ok(())
        })?;
        obj.mark_saved();
        debug!("Created {} with id {}", T::KIND, obj.id());
        Ok(obj)
    }

    /// Save a record under its own transaction and clear its change set
    pub fn save<T: Record>(&self, obj: &mut T) -> Result<()> {
        self.check_writable()?;
        self.transaction(|tx| Self::save_in(tx, obj))?;
        obj.mark_saved();
        Ok(())
    }

    /// Save several records of one type under a single transaction
    pub fn save_all<T: Record>(&self, objs: &mut [T]) -> Result<()> {
        self.check_writable()?;
        self.transaction(|tx| {
            for obj in objs.iter() {
                Self::save_in(tx, obj)?;
            }
            Ok(())
        })?;
        for obj in objs.iter_mut() {
            obj.mark_saved();
        }
        Ok(())
    }

    fn select_sql<T: Record>(where_clause: &str) -> String {
        format!(
            "SELECT id, {} FROM {} WHERE {} ORDER BY id",
            T::COLUMNS.join(", "),
            T::TABLE,
            where_clause
        )
    }

    /// Load a record by id
    pub fn load<T: Record>(&self, id: ObjectId) -> Result<Option<T>> {
        let conn = self.conn.lock();
        let mut obj = conn
            .query_row(&Self::select_sql::<T>("id = ?1"), params![id], |row| {
                T::from_row(row)
            })
            .optional()?;
        if let Some(obj) = obj.as_mut() {
            obj.set_readonly(self.readonly);
        }
        Ok(obj)
    }

    /// Load a record by id, or fail with NotFound
    pub fn load_required<T: Record>(&self, id: ObjectId) -> Result<T> {
        self.load(id)?.ok_or_else(|| Error::NotFound {
            kind: T::KIND.to_string(),
            id: id.to_string(),
        })
    }

    /// Load all records matching a WHERE clause
    pub fn load_where<T: Record>(
        &self,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<T>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&Self::select_sql::<T>(where_clause))?;
        let rows = stmt.query_map(params, |row| T::from_row(row))?;
        let mut results = Vec::new();
        for row in rows {
            let mut obj = row?;
            obj.set_readonly(self.readonly);
            results.push(obj);
        }
        Ok(results)
    }

    /// Load at most one record matching a WHERE clause
    pub fn load_one_where<T: Record>(
        &self,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<T>> {
        Ok(self.load_where(where_clause, params)?.into_iter().next())
    }

    /// Load every record of a type
    pub fn load_all<T: Record>(&self) -> Result<Vec<T>> {
        self.load_where::<T>("1 = 1", &[])
    }

    /// Delete a record, detaching its ownership edges first
    pub fn delete<T: Record>(&self, id: ObjectId) -> Result<bool> {
        self.check_writable()?;
        self.transaction(|tx| {
            if T::TABLE == Uvn::TABLE {
                tx.execute(
                    "DELETE FROM uvns_credentials WHERE uvn_id = ?1",
                    params![id],
                )?;
            }
            let rows = tx.execute(
                &format!("DELETE FROM {} WHERE id = ?1", T::TABLE),
                params![id],
            )?;
            Ok(rows > 0)
        })
    }

    /// Delete rows matching a WHERE clause on an arbitrary table
    pub fn delete_where(
        &self,
        table: &str,
        where_clause: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<usize> {
        self.check_writable()?;
        let conn = self.conn.lock();
        let rows = conn.execute(
            &format!("DELETE FROM {} WHERE {}", table, where_clause),
            params,
        )?;
        Ok(rows)
    }

    /// Record the owner of a uvn in its dedicated owner table
    pub fn set_uvn_owner(&self, uvn_id: ObjectId, owner_id: ObjectId) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO uvns_credentials (uvn_id, owner_id) VALUES (?1, ?2)",
            params![uvn_id, owner_id],
        )?;
        Ok(())
    }

    /// Owner of a uvn, if recorded
    pub fn uvn_owner(&self, uvn_id: ObjectId) -> Result<Option<ObjectId>> {
        let conn = self.conn.lock();
        let owner = conn
            .query_row(
                "SELECT owner_id FROM uvns_credentials WHERE uvn_id = ?1",
                params![uvn_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    /// Names of all user tables
    pub fn table_names(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    fn read_table_rows(
        &self,
        table: &str,
        where_clause: Option<&str>,
    ) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
        let conn = self.conn.lock();
        let sql = match where_clause {
            Some(w) => format!("SELECT * FROM {} WHERE {}", table, w),
            None => format!("SELECT * FROM {}", table),
        };
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let n = columns.len();
        let rows = stmt.query_map([], |row| {
            let mut values = Vec::with_capacity(n);
            for i in 0..n {
                values.push(row.get::<_, Value>(i)?);
            }
            Ok(values)
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok((columns, out))
    }

    /// Copy a slice of this database into `target`. Used by the registry to
    /// build agent packages. `where_clause` filters the exported rows.
    pub fn export_tables(
        &self,
        target: &Database,
        tables: &[(&str, Option<&str>)],
    ) -> Result<()> {
        target.check_writable()?;
        for (table, where_clause) in tables {
            let (columns, rows) = self.read_table_rows(table, *where_clause)?;
            target.insert_rows(table, &columns, rows)?;
        }
        Ok(())
    }

    fn insert_rows(&self, table: &str, columns: &[String], rows: Vec<Vec<Value>>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let placeholders: Vec<String> =
                (0..columns.len()).map(|i| format!("?{}", i + 1)).collect();
            let sql = format!(
                "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
                table,
                columns.join(", "),
                placeholders.join(", ")
            );
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                stmt.execute(params_from_iter(row))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Import tables from another database. For each entry, existing rows are
    /// dropped first when `drop_existing` is set (per-class semantics).
    pub fn import_other(
        &self,
        other: &Database,
        tables: &[ImportSpec<'_>],
    ) -> Result<()> {
        self.check_writable()?;
        for spec in tables {
            if spec.drop_existing {
                let conn = self.conn.lock();
                conn.execute(&format!("DELETE FROM {}", spec.table), [])?;
            }
            let (columns, rows) = other.read_table_rows(spec.table, spec.where_clause)?;
            self.insert_rows(spec.table, &columns, rows)?;
            debug!("imported table {}", spec.table);
        }
        Ok(())
    }

    /// Write a consistent snapshot of the whole database to `path`
    pub fn backup_to(&self, path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let conn = self.conn.lock();
        conn.execute("VACUUM INTO ?1", params![path.to_string_lossy()])?;
        Ok(())
    }
}

/// One table to import, with its per-class semantics
#[derive(Debug, Clone, Copy)]
pub struct ImportSpec<'a> {
    pub table: &'a str,
    pub where_clause: Option<&'a str>,
    pub drop_existing: bool,
}

impl<'a> ImportSpec<'a> {
    pub fn replace(table: &'a str) -> Self {
        Self {
            table,
            where_clause: None,
            drop_existing: true,
        }
    }

    pub fn merge(table: &'a str) -> Self {
        Self {
            table,
            where_clause: None,
            drop_existing: false,
        }
    }

    pub fn with_where(mut self, where_clause: &'a str) -> Self {
        self.where_clause = Some(where_clause);
        self
    }
}

// ----------------------------------------------------------------------------
// Record implementations for the entity model
// ----------------------------------------------------------------------------

impl Record for Uvn {
    const TABLE: &'static str = "uvns";
    const KIND: &'static str = "uvn";
    const COLUMNS: &'static [&'static str] = &["name", "address", "settings"];

    fn id(&self) -> ObjectId {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn is_changed(&self) -> bool {
        !self.changed.is_empty()
    }

    fn mark_saved(&mut self) {
        self.changed.clear();
    }

    fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    fn bind(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Text(self.name.clone()),
            self.address
                .clone()
                .map(Value::Text)
                .unwrap_or(Value::Null),
            json_value(&self.settings)?,
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            address: row.get(2)?,
            settings: json_col(row, 3)?,
            changed: Default::default(),
            readonly: false,
        })
    }
}

impl Record for Cell {
    const TABLE: &'static str = "cells";
    const KIND: &'static str = "cell";
    const COLUMNS: &'static [&'static str] = &[
        "uvn_id",
        "name",
        "address",
        "allowed_lans",
        "settings",
        "excluded",
        "owner_id",
    ];

    fn id(&self) -> ObjectId {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn is_changed(&self) -> bool {
        !self.changed.is_empty()
    }

    fn mark_saved(&mut self) {
        self.changed.clear();
    }

    fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    fn bind(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Integer(self.uvn_id),
            Value::Text(self.name.clone()),
            self.address
                .clone()
                .map(Value::Text)
                .unwrap_or(Value::Null),
            json_value(&self.allowed_lans)?,
            json_value(&self.settings)?,
            Value::Integer(self.excluded as i64),
            self.owner_id.map(Value::Integer).unwrap_or(Value::Null),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uvn_id: row.get(1)?,
            name: row.get(2)?,
            address: row.get(3)?,
            allowed_lans: json_col(row, 4)?,
            settings: json_col(row, 5)?,
            excluded: row.get(6)?,
            owner_id: row.get(7)?,
            changed: Default::default(),
            readonly: false,
        })
    }
}

impl Ownable for Cell {
    fn owner_id(&self) -> Option<ObjectId> {
        self.owner_id
    }

    fn set_owner_id(&mut self, owner: Option<ObjectId>) {
        if self.owner_id != owner {
            self.owner_id = owner;
            self.changed.insert("owner_id");
        }
    }
}

impl Record for Particle {
    const TABLE: &'static str = "particles";
    const KIND: &'static str = "particle";
    const COLUMNS: &'static [&'static str] = &["uvn_id", "name", "excluded", "owner_id"];

    fn id(&self) -> ObjectId {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn is_changed(&self) -> bool {
        !self.changed.is_empty()
    }

    fn mark_saved(&mut self) {
        self.changed.clear();
    }

    fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    fn bind(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Integer(self.uvn_id),
            Value::Text(self.name.clone()),
            Value::Integer(self.excluded as i64),
            self.owner_id.map(Value::Integer).unwrap_or(Value::Null),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uvn_id: row.get(1)?,
            name: row.get(2)?,
            excluded: row.get(3)?,
            owner_id: row.get(4)?,
            changed: Default::default(),
            readonly: false,
        })
    }
}

impl Ownable for Particle {
    fn owner_id(&self) -> Option<ObjectId> {
        self.owner_id
    }

    fn set_owner_id(&mut self, owner: Option<ObjectId>) {
        if self.owner_id != owner {
            self.owner_id = owner;
            self.changed.insert("owner_id");
        }
    }
}

impl Record for User {
    const TABLE: &'static str = "users";
    const KIND: &'static str = "user";
    const COLUMNS: &'static [&'static str] =
        &["email", "name", "realm", "password", "excluded"];

    fn id(&self) -> ObjectId {
        self.id
    }

    fn set_id(&mut self, id: ObjectId) {
        self.id = id;
    }

    fn is_changed(&self) -> bool {
        !self.changed.is_empty()
    }

    fn mark_saved(&mut self) {
        self.changed.clear();
    }

    fn set_readonly(&mut self, readonly: bool) {
        self.readonly = readonly;
    }

    fn bind(&self) -> Result<Vec<Value>> {
        Ok(vec![
            Value::Text(self.email.clone()),
            Value::Text(self.name.clone()),
            Value::Text(self.realm.clone()),
            Value::Text(self.password.clone()),
            Value::Integer(self.excluded as i64),
        ])
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            name: row.get(2)?,
            realm: row.get(3)?,
            password: row.get(4)?,
            excluded: row.get(5)?,
            changed: Default::default(),
            readonly: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CellSettings;

    fn new_cell(db: &Database, uvn_id: ObjectId, name: &str) -> Cell {
        db.new_record(Cell::new(uvn_id, name.to_string())).unwrap()
    }

    #[test]
    fn test_crud_roundtrip() {
        let db = Database::open_memory().unwrap();
        let mut uvn = db.new_record(Uvn::new("u1".into())).unwrap();
        assert_eq!(uvn.id, 1);

        uvn.set_address(Some("203.0.113.1".into())).unwrap();
        assert!(uvn.is_changed());
        db.save(&mut uvn).unwrap();
        assert!(!uvn.is_changed());

        let loaded: Uvn = db.load_required(uvn.id).unwrap();
        assert_eq!(loaded.name, "u1");
        assert_eq!(loaded.address.as_deref(), Some("203.0.113.1"));
        assert_eq!(loaded.settings, uvn.settings);
    }

    #[test]
    fn test_ids_never_reused() {
        let db = Database::open_memory().unwrap();
        let cell = new_cell(&db, 1, "c1");
        let first = cell.id;
        assert!(db.delete::<Cell>(first).unwrap());
        let cell = new_cell(&db, 1, "c2");
        assert!(cell.id > first);
    }

    #[test]
    fn test_readonly_database_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path()).unwrap();
            new_cell(&db, 1, "c1");
        }
        let db = Database::open_readonly(dir.path()).unwrap();
        let mut cell: Cell = db.load_required(1).unwrap();
        assert!(cell.readonly);
        assert!(db.save(&mut cell).is_err());
        assert!(db.delete::<Cell>(1).is_err());
    }

    #[test]
    fn test_uvn_ownership_edge() {
        let db = Database::open_memory().unwrap();
        let uvn = db.new_record(Uvn::new("u1".into())).unwrap();
        let owner = db
            .new_record(User::new(
                "root@example.org".into(),
                "root".into(),
                "u1".into(),
                "secret",
            ))
            .unwrap();
        db.set_uvn_owner(uvn.id, owner.id).unwrap();
        assert_eq!(db.uvn_owner(uvn.id).unwrap(), Some(owner.id));
        // Deleting the uvn detaches the edge
        db.delete::<Uvn>(uvn.id).unwrap();
        assert_eq!(db.uvn_owner(uvn.id).unwrap(), None);
    }

    #[test]
    fn test_export_import() {
        let db = Database::open_memory().unwrap();
        let mut cell = Cell::new(7, "c1".to_string());
        cell.settings = CellSettings {
            httpd_port: 9000,
            enable_particles_vpn: false,
        };
        let cell = db.new_record(cell).unwrap();

        let target = Database::open_memory().unwrap();
        db.export_tables(&target, &[("cells", None)]).unwrap();
        let exported: Cell = target.load_required(cell.id).unwrap();
        assert_eq!(exported.name, cell.name);
        assert_eq!(exported.settings, cell.settings);

        // Re-import replaces existing rows
        let fresh = Database::open_memory().unwrap();
        fresh
            .import_other(&target, &[ImportSpec::replace("cells")])
            .unwrap();
        let imported: Cell = fresh.load_required(cell.id).unwrap();
        assert_eq!(imported.settings.httpd_port, 9000);
    }

    #[test]
    fn test_load_where() {
        let db = Database::open_memory().unwrap();
        new_cell(&db, 1, "c1");
        let mut c2 = Cell::new(1, "c2".to_string());
        c2.excluded = true;
        db.new_record(c2).unwrap();

        let active: Vec<Cell> = db
            .load_where("uvn_id = ?1 AND excluded = ?2", &[&1i64, &false])
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "c1");
    }
}
