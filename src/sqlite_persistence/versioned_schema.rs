use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection};
use tracing::info;

/// Offset added to every schema version stored in `PRAGMA user_version`,
/// so a database created by something else is never mistaken for ours.
pub const BASE_DB_VERSION: usize = 31000;

#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            #[allow(unused_mut)]
            let mut column = $crate::sqlite_persistence::Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
                default_value: None,
                foreign_key: None,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

#[derive(Debug, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
}

impl SqlType {
    fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
        }
    }

    fn parse(s: &str) -> Option<&'static SqlType> {
        match s {
            "TEXT" => Some(&SqlType::Text),
            "INTEGER" => Some(&SqlType::Integer),
            _ => None,
        }
    }
}

#[allow(unused)]
pub enum ForeignKeyOnChange {
    NoAction,
    Cascade,
}

impl ForeignKeyOnChange {
    fn as_sql(&self) -> &'static str {
        match self {
            ForeignKeyOnChange::NoAction => "NO ACTION",
            ForeignKeyOnChange::Cascade => "CASCADE",
        }
    }
}

pub struct ForeignKey {
    pub foreign_table: &'static str,
    pub foreign_column: &'static str,
    pub on_delete: ForeignKeyOnChange,
}

pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
    pub default_value: Option<&'static str>,
    pub foreign_key: Option<&'static ForeignKey>,
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub indices: &'static [(&'static str, &'static str)],
    pub unique_constraints: &'static [&'static [&'static str]],
}

impl Table {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let mut definitions: Vec<String> = self
            .columns
            .iter()
            .map(|column| {
                let mut def = format!("{} {}", column.name, column.sql_type.as_sql());
                if column.is_primary_key {
                    def.push_str(" PRIMARY KEY");
                }
                if column.non_null {
                    def.push_str(" NOT NULL");
                }
                if let Some(default_value) = column.default_value {
                    def.push_str(&format!(" DEFAULT {}", default_value));
                }
                if let Some(fk) = column.foreign_key {
                    def.push_str(&format!(
                        " REFERENCES {}({}) ON DELETE {}",
                        fk.foreign_table,
                        fk.foreign_column,
                        fk.on_delete.as_sql()
                    ));
                }
                def
            })
            .collect();
        for unique_constraint in self.unique_constraints {
            definitions.push(format!("UNIQUE ({})", unique_constraint.join(", ")));
        }

        conn.execute(
            &format!("CREATE TABLE {} ({});", self.name, definitions.join(", ")),
            params![],
        )?;

        for (index_name, columns) in self.indices {
            conn.execute(
                &format!("CREATE INDEX {} ON {}({});", index_name, self.name, columns),
                params![],
            )?;
        }
        Ok(())
    }

    fn validate(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", self.name))?;
        let actual: Vec<(String, String, bool, bool)> = stmt
            .query_map(params![], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i32>(3)? == 1,
                    row.get::<_, i32>(5)? > 0,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        if actual.len() != self.columns.len() {
            bail!(
                "Table {} has {} columns, expected {}",
                self.name,
                actual.len(),
                self.columns.len()
            );
        }

        for ((name, sql_type, non_null, is_pk), expected) in actual.iter().zip(self.columns) {
            if name != expected.name {
                bail!(
                    "Table {} column name mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    name
                );
            }
            if SqlType::parse(sql_type) != Some(expected.sql_type) {
                bail!(
                    "Table {} column {} type mismatch: expected {:?}, got {}",
                    self.name,
                    expected.name,
                    expected.sql_type,
                    sql_type
                );
            }
            if *non_null != expected.non_null || *is_pk != expected.is_primary_key {
                bail!(
                    "Table {} column {} constraint mismatch",
                    self.name,
                    expected.name
                );
            }
        }

        for (index_name, _) in self.indices {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='index' AND name=?1 AND tbl_name=?2",
                    params![index_name, self.name],
                    |_| Ok(()),
                )
                .is_ok();
            if !exists {
                bail!("Table {} is missing index '{}'", self.name, index_name);
            }
        }
        Ok(())
    }
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute("PRAGMA foreign_keys = ON;", params![])?;
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.validate(conn)?;
        }
        Ok(())
    }
}

/// Brings an opened connection up to the latest of `schemas`.
///
/// An empty database gets the latest schema created from scratch. Otherwise
/// the stored version is validated against its schema and every later
/// migration runs in order.
pub fn prepare_database(conn: &Connection, schemas: &[VersionedSchema], label: &str) -> Result<()> {
    conn.execute("PRAGMA foreign_keys = ON;", [])?;
    let latest = schemas.last().context("No schemas defined")?;

    let raw_version = conn
        .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
        .context("Failed to read database version")?;

    if raw_version == 0 {
        latest.create(conn)?;
        info!("Created new {} database at version {}", label, latest.version);
        return Ok(());
    }

    let db_version = raw_version - BASE_DB_VERSION as i64;
    if db_version < 0 {
        bail!(
            "{} database version {} does not contain base db version {}",
            label,
            raw_version,
            BASE_DB_VERSION
        );
    }
    let version = db_version as usize;
    if version > latest.version {
        bail!(
            "{} database version {} is too new (max supported: {})",
            label,
            version,
            latest.version
        );
    }

    schemas
        .iter()
        .find(|s| s.version == version)
        .with_context(|| format!("Unknown {} schema version {}", label, version))?
        .validate(conn)?;

    if version < latest.version {
        info!(
            "Migrating {} database from version {} to {}",
            label, version, latest.version
        );
        for schema in schemas.iter().filter(|s| s.version > version) {
            if let Some(migration) = schema.migration {
                migration(conn)?;
            }
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest.version),
            [],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_column;

    const PARENT: ForeignKey = ForeignKey {
        foreign_table: "parent",
        foreign_column: "id",
        on_delete: ForeignKeyOnChange::Cascade,
    };

    const TEST_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
        version: 0,
        tables: &[
            Table {
                name: "parent",
                columns: &[
                    sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
                    sqlite_column!("name", &SqlType::Text, non_null = true),
                ],
                indices: &[("idx_parent_name", "name")],
                unique_constraints: &[],
            },
            Table {
                name: "child",
                columns: &[
                    sqlite_column!(
                        "parent_id",
                        &SqlType::Integer,
                        non_null = true,
                        foreign_key = Some(&PARENT)
                    ),
                    sqlite_column!("key", &SqlType::Text, non_null = true),
                ],
                indices: &[],
                unique_constraints: &[&["parent_id", "key"]],
            },
        ],
        migration: None,
    }];

    #[test]
    fn test_prepare_creates_then_validates() {
        let conn = Connection::open_in_memory().unwrap();
        prepare_database(&conn, TEST_SCHEMAS, "test").unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version as usize, BASE_DB_VERSION);

        // Second open goes through validation instead of creation
        prepare_database(&conn, TEST_SCHEMAS, "test").unwrap();
    }

    #[test]
    fn test_validate_detects_missing_index() {
        let conn = Connection::open_in_memory().unwrap();
        TEST_SCHEMAS[0].create(&conn).unwrap();
        conn.execute("DROP INDEX idx_parent_name", []).unwrap();

        let err = TEST_SCHEMAS[0].validate(&conn).unwrap_err();
        assert!(err.to_string().contains("idx_parent_name"));
    }

    #[test]
    fn test_rejects_foreign_database() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("PRAGMA user_version = 7", []).unwrap();

        assert!(prepare_database(&conn, TEST_SCHEMAS, "test").is_err());
    }

    #[test]
    fn test_cascade_delete_removes_children() {
        let conn = Connection::open_in_memory().unwrap();
        prepare_database(&conn, TEST_SCHEMAS, "test").unwrap();
        conn.execute("INSERT INTO parent (id, name) VALUES (1, 'a')", [])
            .unwrap();
        conn.execute("INSERT INTO child (parent_id, key) VALUES (1, 'k')", [])
            .unwrap();
        conn.execute("DELETE FROM parent WHERE id = 1", []).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM child", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
