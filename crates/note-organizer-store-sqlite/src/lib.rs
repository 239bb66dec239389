use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use note_organizer_core::{CreateMode, NoteId, NoteStore, OrganizerConfig, StoreError};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS collection_meta (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  schema_modified_at TEXT NOT NULL,
  lock_owner TEXT
);

CREATE TABLE IF NOT EXISTS note_types (
  name TEXT PRIMARY KEY,
  fields_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS notes (
  id INTEGER PRIMARY KEY,
  note_type TEXT NOT NULL REFERENCES note_types(name),
  fields_json TEXT NOT NULL,
  tags TEXT NOT NULL DEFAULT '',
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cards (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  note_id INTEGER NOT NULL REFERENCES notes(id),
  ord INTEGER NOT NULL,
  due INTEGER NOT NULL DEFAULT 0,
  interval INTEGER NOT NULL DEFAULT 0,
  ease_factor INTEGER NOT NULL DEFAULT 2500,
  reps INTEGER NOT NULL DEFAULT 0,
  lapses INTEGER NOT NULL DEFAULT 0,
  UNIQUE(note_id, ord)
);

CREATE INDEX IF NOT EXISTS idx_cards_note_id ON cards(note_id);
";

/// One dependent card row. Scheduling columns are opaque to the organizer;
/// "duplicate with scheduling" copies them verbatim, a plain duplicate
/// resets them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Card {
    pub ord: u32,
    pub due: i64,
    pub interval: i64,
    pub ease_factor: i64,
    pub reps: i64,
    pub lapses: i64,
}

impl Default for Card {
    fn default() -> Self {
        Self { ord: 0, due: 0, interval: 0, ease_factor: 2500, reps: 0, lapses: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    pub id: NoteId,
    pub note_type: String,
    pub fields: BTreeMap<String, String>,
    pub tags: Vec<String>,
    pub updated_at: String,
}

/// SQLite-backed note collection: notes plus their dependent card rows,
/// note types defining each note's field set, and the collection metadata
/// row that carries the schema-modification stamp and the exclusive
/// rearrange lease.
pub struct SqliteCollection {
    conn: Connection,
    config: OrganizerConfig,
    lease: Option<String>,
}

impl SqliteCollection {
    /// Open a collection database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path, config: OrganizerConfig) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open collection at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, config, lease: None })
    }

    /// Current schema version, 0 for a blank database.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_version(&self) -> Result<i64> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        current_schema_version(&self.conn)
    }

    /// Apply all forward migrations and seed the collection metadata row
    /// plus the configured default note type.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration 1")?;
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                    params![1_i64, now_rfc3339()?],
                )
                .context("failed to record migration version 1")?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        self.conn
            .execute(
                "INSERT OR IGNORE INTO collection_meta(id, schema_modified_at) VALUES (1, ?1)",
                params![now_rfc3339()?],
            )
            .context("failed to seed collection metadata")?;

        let default_type = self.config.default_note_type.clone();
        if self.note_type_fields(&default_type)?.is_none() {
            let mut fields = vec!["Front".to_string(), "Back".to_string()];
            if let Some(backup) = self.config.backup_field.clone() {
                fields.push(backup);
            }
            self.add_note_type(&default_type, &fields)?;
        }

        Ok(())
    }

    /// Register a note type and the ordered field names it declares.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn add_note_type(&mut self, name: &str, fields: &[String]) -> Result<()> {
        if name.trim().is_empty() {
            return Err(anyhow!("note type name MUST be non-empty"));
        }
        self.conn
            .execute(
                "INSERT OR REPLACE INTO note_types(name, fields_json) VALUES (?1, ?2)",
                params![
                    name,
                    serde_json::to_string(fields).context("failed to serialize field names")?
                ],
            )
            .context("failed to insert note type")?;
        Ok(())
    }

    /// Ordered field names a note type declares, or `None` for an unknown
    /// type.
    ///
    /// # Errors
    /// Returns an error when lookup or JSON decoding fails.
    pub fn note_type_fields(&self, name: &str) -> Result<Option<Vec<String>>> {
        let raw = self
            .conn
            .prepare("SELECT fields_json FROM note_types WHERE name = ?1")?
            .query_row(params![name], |row| row.get::<_, String>(0))
            .optional()?;
        match raw {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).context("failed to decode note type fields")?,
            )),
            None => Ok(None),
        }
    }

    /// Insert a new note of `note_type` with one unscheduled card, assigning
    /// a fresh timestamp-derived id. Declared fields missing from `fields`
    /// are stored empty; unknown field names are rejected.
    ///
    /// # Errors
    /// Returns an error for an unknown type, an unknown field name, or a
    /// failed write.
    pub fn add_note(
        &mut self,
        note_type: &str,
        fields: &[(String, String)],
        tags: &[String],
    ) -> Result<NoteId> {
        let declared = self
            .note_type_fields(note_type)?
            .ok_or_else(|| anyhow!("unknown note type: {note_type}"))?;

        let mut field_map: BTreeMap<String, String> =
            declared.iter().map(|name| (name.clone(), String::new())).collect();
        for (name, value) in fields {
            if !field_map.contains_key(name) {
                return Err(anyhow!("note type {note_type} has no field named {name}"));
            }
            field_map.insert(name.clone(), value.clone());
        }

        let id = self.fresh_id()?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO notes(id, note_type, fields_json, tags, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.0,
                note_type,
                serde_json::to_string(&field_map).context("failed to serialize fields")?,
                tags.join(" "),
                now_rfc3339()?,
            ],
        )
        .context("failed to insert note")?;
        tx.execute(
            "INSERT INTO cards(note_id, ord) VALUES (?1, 0)",
            params![id.0],
        )
        .context("failed to insert card")?;
        tx.commit().context("failed to commit note insert")?;
        Ok(id)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_note(&self, id: NoteId) -> Result<Option<Note>> {
        let row = self
            .conn
            .prepare(
                "SELECT note_type, fields_json, tags, updated_at FROM notes WHERE id = ?1",
            )?
            .query_row(params![id.0], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .optional()?;

        match row {
            Some((note_type, fields_json, tags, updated_at)) => Ok(Some(Note {
                id,
                note_type,
                fields: serde_json::from_str(&fields_json)
                    .context("failed to decode note fields")?,
                tags: split_tags(&tags),
                updated_at,
            })),
            None => Ok(None),
        }
    }

    /// All notes ordered by id, i.e. in creation-timestamp order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_notes(&self) -> Result<Vec<Note>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, note_type, fields_json, tags, updated_at FROM notes ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut notes = Vec::new();
        while let Some(row) = rows.next()? {
            let fields_json: String = row.get(2)?;
            let tags: String = row.get(3)?;
            notes.push(Note {
                id: NoteId(row.get(0)?),
                note_type: row.get(1)?,
                fields: serde_json::from_str(&fields_json)
                    .context("failed to decode note fields")?,
                tags: split_tags(&tags),
                updated_at: row.get(4)?,
            });
        }
        Ok(notes)
    }

    /// Cards of one note ordered by ordinal.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn cards_for_note(&self, id: NoteId) -> Result<Vec<Card>> {
        let mut stmt = self.conn.prepare(
            "SELECT ord, due, interval, ease_factor, reps, lapses
             FROM cards WHERE note_id = ?1 ORDER BY ord ASC",
        )?;
        let mut rows = stmt.query(params![id.0])?;
        let mut cards = Vec::new();
        while let Some(row) = rows.next()? {
            cards.push(Card {
                ord: row.get(0)?,
                due: row.get(1)?,
                interval: row.get(2)?,
                ease_factor: row.get(3)?,
                reps: row.get(4)?,
                lapses: row.get(5)?,
            });
        }
        Ok(cards)
    }

    /// Online-backup the whole collection to `out_file`. Callers take one
    /// before a rearrange session as the recovery path for a mid-pass
    /// crash.
    ///
    /// # Errors
    /// Returns an error when directories cannot be created or backup fails.
    pub fn checkpoint(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for {}", out_file.display())
            })?;
        }
        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to checkpoint to {}", out_file.display()))?;
        Ok(())
    }

    /// RFC3339 stamp of the last schema modification, bumped every time a
    /// rearrange lease is taken. Sync layers treat a change here as "full
    /// upload required".
    ///
    /// # Errors
    /// Returns an error when the metadata row is missing.
    pub fn schema_modified_at(&self) -> Result<String> {
        self.conn
            .prepare("SELECT schema_modified_at FROM collection_meta WHERE id = 1")?
            .query_row([], |row| row.get::<_, String>(0))
            .optional()?
            .ok_or_else(|| anyhow!("collection metadata missing; run migrate first"))
    }

    /// Fresh timestamp-derived id: now in milliseconds, probed upward past
    /// any existing note.
    fn fresh_id(&self) -> Result<NoteId, StoreError> {
        let mut id = NoteId(now_millis()?);
        while self.id_present(id)? {
            id = id.next();
        }
        Ok(id)
    }

    fn id_present(&self, id: NoteId) -> Result<bool, StoreError> {
        let present = self
            .conn
            .prepare("SELECT 1 FROM notes WHERE id = ?1")
            .map_err(backend)?
            .query_row(params![id.0], |_| Ok(()))
            .optional()
            .map_err(backend)?;
        Ok(present.is_some())
    }

    fn load_fields(&self, id: NoteId) -> Result<(String, BTreeMap<String, String>), StoreError> {
        let row = self
            .conn
            .prepare("SELECT note_type, fields_json FROM notes WHERE id = ?1")
            .map_err(backend)?
            .query_row(params![id.0], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()
            .map_err(backend)?;
        let (note_type, fields_json) = row.ok_or(StoreError::NotFound(id))?;
        let fields = serde_json::from_str(&fields_json)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok((note_type, fields))
    }

    fn store_fields(
        &mut self,
        id: NoteId,
        fields: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(fields).map_err(|err| StoreError::Backend(err.to_string()))?;
        let changed = self
            .conn
            .execute(
                "UPDATE notes SET fields_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![json, now_rfc3339().map_err(any_backend)?, id.0],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Field names declared by the type of the note `id`, resolved for the
    /// backup-field check.
    fn declared_fields(&self, note_type: &str) -> Result<Vec<String>, StoreError> {
        let raw = self
            .conn
            .prepare("SELECT fields_json FROM note_types WHERE name = ?1")
            .map_err(backend)?
            .query_row(params![note_type], |row| row.get::<_, String>(0))
            .optional()
            .map_err(backend)?;
        match raw {
            Some(json) => {
                serde_json::from_str(&json).map_err(|err| StoreError::Backend(err.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }
}

impl NoteStore for SqliteCollection {
    /// Take the collection's exclusive rearrange lease and bump the
    /// schema-modification stamp. A held lease means another organizer
    /// session owns the collection.
    fn lock_exclusive(&mut self) -> Result<(), StoreError> {
        let token = format!("organizer-{}", now_nanos());
        let changed = self
            .conn
            .execute(
                "UPDATE collection_meta
                 SET lock_owner = ?1, schema_modified_at = ?2
                 WHERE id = 1 AND lock_owner IS NULL",
                params![token, now_rfc3339().map_err(any_backend)?],
            )
            .map_err(backend)?;
        if changed == 0 {
            let owner = self
                .conn
                .prepare("SELECT lock_owner FROM collection_meta WHERE id = 1")
                .map_err(backend)?
                .query_row([], |row| row.get::<_, Option<String>>(0))
                .optional()
                .map_err(backend)?;
            return match owner {
                Some(Some(owner)) => Err(StoreError::LockUnavailable(format!(
                    "collection is locked by {owner}"
                ))),
                _ => Err(StoreError::Backend(
                    "collection metadata missing; run migrate first".to_string(),
                )),
            };
        }
        debug!(%token, "acquired exclusive rearrange lease");
        self.lease = Some(token);
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), StoreError> {
        let Some(token) = self.lease.take() else {
            return Ok(());
        };
        self.conn
            .execute(
                "UPDATE collection_meta SET lock_owner = NULL WHERE id = 1 AND lock_owner = ?1",
                params![token],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn exists(&self, id: NoteId) -> Result<bool, StoreError> {
        self.id_present(id)
    }

    fn create_from_sample(
        &mut self,
        sample: NoteId,
        mode: &CreateMode,
    ) -> Result<NoteId, StoreError> {
        let (sample_type, sample_fields) = self.load_fields(sample)?;
        let sample_tags: String = self
            .conn
            .prepare("SELECT tags FROM notes WHERE id = ?1")
            .map_err(backend)?
            .query_row(params![sample.0], |row| row.get(0))
            .map_err(backend)?;
        let sample_cards = self.cards_for_note(sample).map_err(any_backend)?;

        let (note_type, fields, tags, cards) = match mode {
            CreateMode::Blank { note_type } => {
                let name = match note_type.as_deref() {
                    Some(name) => {
                        if self.declared_fields(name)?.is_empty() {
                            sample_type
                        } else {
                            name.to_string()
                        }
                    }
                    None => sample_type,
                };
                let blank: BTreeMap<String, String> = self
                    .declared_fields(&name)?
                    .into_iter()
                    .map(|field| (field, String::new()))
                    .collect();
                (name, blank, String::new(), vec![Card::default()])
            }
            CreateMode::Clone { carry_schedule } => {
                let cards = sample_cards
                    .iter()
                    .map(|card| {
                        if *carry_schedule {
                            card.clone()
                        } else {
                            Card { ord: card.ord, ..Card::default() }
                        }
                    })
                    .collect();
                (sample_type, sample_fields, sample_tags, cards)
            }
        };

        let id = self.fresh_id()?;
        let json =
            serde_json::to_string(&fields).map_err(|err| StoreError::Backend(err.to_string()))?;
        let stamp = now_rfc3339().map_err(any_backend)?;
        let tx = self.conn.transaction().map_err(backend)?;
        tx.execute(
            "INSERT INTO notes(id, note_type, fields_json, tags, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.0, note_type, json, tags, stamp],
        )
        .map_err(backend)?;
        for card in &cards {
            tx.execute(
                "INSERT INTO cards(note_id, ord, due, interval, ease_factor, reps, lapses)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.0,
                    card.ord,
                    card.due,
                    card.interval,
                    card.ease_factor,
                    card.reps,
                    card.lapses
                ],
            )
            .map_err(backend)?;
        }
        tx.commit().map_err(backend)?;
        debug!(sample = %sample, created = %id, "created note from sample");
        Ok(id)
    }

    fn delete(&mut self, id: NoteId) -> Result<(), StoreError> {
        let tx = self.conn.transaction().map_err(backend)?;
        tx.execute("DELETE FROM cards WHERE note_id = ?1", params![id.0]).map_err(backend)?;
        let changed =
            tx.execute("DELETE FROM notes WHERE id = ?1", params![id.0]).map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        tx.commit().map_err(backend)?;
        Ok(())
    }

    /// Rename a note id; the note row and its cards move in one
    /// transaction, with foreign-key checks deferred until commit.
    fn renumber(&mut self, old: NoteId, new: NoteId) -> Result<(), StoreError> {
        if self.id_present(new)? {
            return Err(StoreError::IdTaken(new));
        }
        let stamp = now_rfc3339().map_err(any_backend)?;
        let tx = self.conn.transaction().map_err(backend)?;
        tx.execute_batch("PRAGMA defer_foreign_keys = ON;").map_err(backend)?;
        let changed = tx
            .execute(
                "UPDATE notes SET id = ?1, updated_at = ?2 WHERE id = ?3",
                params![new.0, stamp, old.0],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::NotFound(old));
        }
        tx.execute(
            "UPDATE cards SET note_id = ?1 WHERE note_id = ?2",
            params![new.0, old.0],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        Ok(())
    }

    fn read_backup_field(&self, id: NoteId) -> Result<Option<String>, StoreError> {
        let Some(backup) = self.config.backup_field.as_deref() else {
            return Ok(None);
        };
        let (note_type, fields) = self.load_fields(id)?;
        if !self.declared_fields(&note_type)?.iter().any(|field| field == backup) {
            return Ok(None);
        }
        Ok(Some(fields.get(backup).cloned().unwrap_or_default()))
    }

    fn write_backup_field(&mut self, id: NoteId, value: NoteId) -> Result<(), StoreError> {
        let Some(backup) = self.config.backup_field.clone() else {
            return Ok(());
        };
        let (_, mut fields) = self.load_fields(id)?;
        fields.insert(backup, value.to_string());
        self.store_fields(id, &fields)
    }
}

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn any_backend(err: anyhow::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .prepare("SELECT MAX(version) FROM schema_migrations")?
        .query_row([], |row| row.get::<_, Option<i64>>(0))
        .optional()?
        .flatten()
        .unwrap_or(0);
    Ok(version)
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(ToString::to_string).collect()
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format timestamp")
}

fn now_millis() -> Result<i64, StoreError> {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000)
        .map_err(|err| StoreError::Backend(err.to_string()))
}

fn now_nanos() -> i128 {
    OffsetDateTime::now_utc().unix_timestamp_nanos()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use note_organizer_core::Rearranger;

    use super::*;

    fn open_memory() -> SqliteCollection {
        let mut store =
            SqliteCollection::open(Path::new(":memory:"), OrganizerConfig::default()).unwrap();
        store.migrate().unwrap();
        store
    }

    fn temp_db(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}.sqlite3", now_nanos()))
    }

    fn seed_note(store: &mut SqliteCollection, id: i64, front: &str) {
        store
            .conn
            .execute(
                "INSERT INTO notes(id, note_type, fields_json, tags, updated_at)
                 VALUES (?1, 'Basic', ?2, '', ?3)",
                params![
                    id,
                    serde_json::to_string(&BTreeMap::from([
                        ("Front".to_string(), front.to_string()),
                        ("Back".to_string(), String::new()),
                        ("onid".to_string(), String::new()),
                    ]))
                    .unwrap(),
                    now_rfc3339().unwrap(),
                ],
            )
            .unwrap();
        store
            .conn
            .execute("INSERT INTO cards(note_id, ord, due) VALUES (?1, 0, ?2)", params![id, id])
            .unwrap();
    }

    #[test]
    fn migrate_creates_schema_and_default_type() {
        let store = open_memory();
        assert_eq!(store.schema_version().unwrap(), 1);
        let fields = store.note_type_fields("Basic").unwrap().unwrap();
        assert_eq!(fields, vec!["Front", "Back", "onid"]);
        assert!(store.schema_modified_at().is_ok());
    }

    #[test]
    fn add_and_read_note_round_trip() {
        let mut store = open_memory();
        let id = store
            .add_note(
                "Basic",
                &[("Front".to_string(), "question".to_string())],
                &["geo".to_string()],
            )
            .unwrap();

        let note = store.get_note(id).unwrap().unwrap();
        assert_eq!(note.note_type, "Basic");
        assert_eq!(note.fields.get("Front").map(String::as_str), Some("question"));
        assert_eq!(note.fields.get("Back").map(String::as_str), Some(""));
        assert_eq!(note.tags, vec!["geo"]);
        assert_eq!(store.cards_for_note(id).unwrap().len(), 1);
    }

    #[test]
    fn add_note_rejects_unknown_type_and_field() {
        let mut store = open_memory();
        assert!(store.add_note("Missing", &[], &[]).is_err());
        assert!(store
            .add_note("Basic", &[("Bogus".to_string(), "x".to_string())], &[])
            .is_err());
    }

    #[test]
    fn renumber_moves_note_and_cards_atomically() {
        let mut store = open_memory();
        seed_note(&mut store, 100, "front");
        store
            .conn
            .execute("INSERT INTO cards(note_id, ord, due) VALUES (100, 1, 7)", [])
            .unwrap();

        store.renumber(NoteId(100), NoteId(500)).unwrap();

        assert!(!store.exists(NoteId(100)).unwrap());
        assert!(store.exists(NoteId(500)).unwrap());
        assert_eq!(store.cards_for_note(NoteId(500)).unwrap().len(), 2);
        assert!(store.cards_for_note(NoteId(100)).unwrap().is_empty());
    }

    #[test]
    fn renumber_rejects_taken_id_and_missing_note() {
        let mut store = open_memory();
        seed_note(&mut store, 100, "a");
        seed_note(&mut store, 200, "b");

        assert_eq!(
            store.renumber(NoteId(100), NoteId(200)).unwrap_err(),
            StoreError::IdTaken(NoteId(200))
        );
        assert_eq!(
            store.renumber(NoteId(999), NoteId(300)).unwrap_err(),
            StoreError::NotFound(NoteId(999))
        );
    }

    #[test]
    fn delete_removes_note_and_cards() {
        let mut store = open_memory();
        seed_note(&mut store, 100, "front");

        store.delete(NoteId(100)).unwrap();

        assert!(!store.exists(NoteId(100)).unwrap());
        assert!(store.cards_for_note(NoteId(100)).unwrap().is_empty());
        assert_eq!(
            store.delete(NoteId(100)).unwrap_err(),
            StoreError::NotFound(NoteId(100))
        );
    }

    #[test]
    fn clone_with_schedule_copies_cards_verbatim() {
        let mut store = open_memory();
        seed_note(&mut store, 100, "front");

        let with_sched = store
            .create_from_sample(NoteId(100), &CreateMode::Clone { carry_schedule: true })
            .unwrap();
        let without = store
            .create_from_sample(NoteId(100), &CreateMode::Clone { carry_schedule: false })
            .unwrap();

        assert_eq!(store.cards_for_note(with_sched).unwrap()[0].due, 100);
        assert_eq!(store.cards_for_note(without).unwrap()[0].due, 0);
        let clone = store.get_note(with_sched).unwrap().unwrap();
        assert_eq!(clone.fields.get("Front").map(String::as_str), Some("front"));
    }

    #[test]
    fn blank_create_falls_back_to_sample_type_for_unknown_name() {
        let mut store = open_memory();
        seed_note(&mut store, 100, "front");

        let id = store
            .create_from_sample(
                NoteId(100),
                &CreateMode::Blank { note_type: Some("Cloze".to_string()) },
            )
            .unwrap();

        let note = store.get_note(id).unwrap().unwrap();
        assert_eq!(note.note_type, "Basic");
        assert_eq!(note.fields.get("Front").map(String::as_str), Some(""));
    }

    #[test]
    fn backup_field_round_trip_and_absence() {
        let mut store = open_memory();
        seed_note(&mut store, 100, "front");

        assert_eq!(store.read_backup_field(NoteId(100)).unwrap(), Some(String::new()));
        store.write_backup_field(NoteId(100), NoteId(100)).unwrap();
        assert_eq!(store.read_backup_field(NoteId(100)).unwrap(), Some("100".to_string()));

        // A type without the field reports it undefined.
        store.add_note_type("Plain", &["Front".to_string()]).unwrap();
        let plain = store.add_note("Plain", &[], &[]).unwrap();
        assert_eq!(store.read_backup_field(plain).unwrap(), None);
    }

    #[test]
    fn backup_disabled_by_config() {
        let mut store = SqliteCollection::open(
            Path::new(":memory:"),
            OrganizerConfig { backup_field: None, ..OrganizerConfig::default() },
        )
        .unwrap();
        store.migrate().unwrap();
        seed_note(&mut store, 100, "front");

        assert_eq!(store.read_backup_field(NoteId(100)).unwrap(), None);
        store.write_backup_field(NoteId(100), NoteId(100)).unwrap();
        let note = store.get_note(NoteId(100)).unwrap().unwrap();
        assert_eq!(note.fields.get("onid").map(String::as_str), Some(""));
    }

    #[test]
    fn rearrange_lease_is_exclusive_across_handles() {
        let path = temp_db("organizer-lease");
        {
            let mut first = SqliteCollection::open(&path, OrganizerConfig::default()).unwrap();
            first.migrate().unwrap();
            first.lock_exclusive().unwrap();

            let mut second = SqliteCollection::open(&path, OrganizerConfig::default()).unwrap();
            let err = second.lock_exclusive().unwrap_err();
            assert!(matches!(err, StoreError::LockUnavailable(_)));

            first.unlock().unwrap();
            second.lock_exclusive().unwrap();
            second.unlock().unwrap();
        }
        for suffix in ["", "-wal", "-shm"] {
            let file = PathBuf::from(format!("{}{suffix}", path.display()));
            if file.exists() {
                fs::remove_file(file).unwrap();
            }
        }
    }

    #[test]
    fn checkpoint_produces_an_openable_copy() {
        let mut store = open_memory();
        seed_note(&mut store, 100, "front");

        let backup = temp_db("organizer-checkpoint");
        store.checkpoint(&backup).unwrap();

        let copy = SqliteCollection::open(&backup, OrganizerConfig::default()).unwrap();
        assert!(copy.exists(NoteId(100)).unwrap());
        fs::remove_file(&backup).unwrap();
    }

    #[test]
    fn engine_runs_against_sqlite_collection() {
        let mut store = open_memory();
        for id in [100, 105, 110] {
            seed_note(&mut store, id, "front");
        }

        let tokens: Vec<String> = ["100", "105", "New: Basic", "110"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let outcome = Rearranger::new(&mut store).rearrange(&tokens, None).unwrap();

        assert_eq!(outcome.created.len(), 1);
        assert!(outcome.modified.is_empty());
        let created = outcome.created[0];
        assert!(NoteId(105) < created && created < NoteId(110));
        assert!(store.exists(created).unwrap());
        // Lease released for the next session.
        assert!(store.lock_exclusive().is_ok());
        store.unlock().unwrap();
    }
}
