//! Persisted, mtime-keyed cache of parsed recipes, so a fresh process start
//! does not have to reparse every unchanged recipe file.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::error::Result;
use crate::recipe::Recipe;

const SCHEMA_VERSION: i32 = 1;

const CREATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schema_info (
    version INTEGER PRIMARY KEY,
    description TEXT
);

CREATE TABLE IF NOT EXISTS recipes (
    name TEXT PRIMARY KEY,
    mtime INTEGER NOT NULL,
    recipe_json TEXT NOT NULL
);
"#;

pub struct IndexCacheDb {
    conn: Connection,
}

impl IndexCacheDb {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&self) -> Result<()> {
        let needs_init: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_info'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|count| count == 0)?;

        if needs_init {
            self.conn.execute_batch(CREATE_SCHEMA)?;
            self.conn.execute(
                "INSERT INTO schema_info (version, description) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, "Initial schema"],
            )?;
        }
        Ok(())
    }

    /// Return the cached recipe for `name` iff its stored mtime matches.
    pub fn lookup(&self, name: &str, mtime: u64) -> Result<Option<Recipe>> {
        let row: Option<(i64, String)> = self
            .conn
            .query_row(
                "SELECT mtime, recipe_json FROM recipes WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((cached_mtime, json)) if cached_mtime as u64 == mtime => {
                Ok(Some(serde_json::from_str(&json)?))
            }
            _ => Ok(None),
        }
    }

    pub fn store(&self, name: &str, mtime: u64, recipe: &Recipe) -> Result<()> {
        let json = serde_json::to_string(recipe)?;
        self.conn.execute(
            "INSERT INTO recipes (name, mtime, recipe_json) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET mtime = ?2, recipe_json = ?3",
            params![name, mtime as i64, json],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Recipe;

    fn sample_recipe() -> Recipe {
        Recipe::parse("name: foo\nversion: 1.0.0\n", "yaml").unwrap()
    }

    #[test]
    fn store_and_lookup_roundtrip() {
        let db = IndexCacheDb::in_memory().unwrap();
        let recipe = sample_recipe();
        db.store("foo", 100, &recipe).unwrap();

        let hit = db.lookup("foo", 100).unwrap();
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().name, "foo");
    }

    #[test]
    fn mismatched_mtime_misses() {
        let db = IndexCacheDb::in_memory().unwrap();
        db.store("foo", 100, &sample_recipe()).unwrap();
        assert!(db.lookup("foo", 200).unwrap().is_none());
    }
}
