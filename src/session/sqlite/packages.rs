use std::collections::BTreeMap;

use rusqlite::{Connection, params};

use super::{BUILTIN_PACKAGES, map_sql_error};
use crate::package::canonical_name;
use crate::session::SessionError;

/// Internal tables share this prefix and are hidden from `list_tables`.
pub(super) const INTERNAL_PREFIX: &str = "_remotefit_";

pub(super) fn apply_schema(connection: &Connection) -> Result<(), SessionError> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS _remotefit_packages (
                name TEXT PRIMARY KEY,
                version TEXT NOT NULL
            );",
        )
        .map_err(map_sql_error)?;
    let mut stmt = connection
        .prepare("INSERT OR IGNORE INTO _remotefit_packages (name, version) VALUES (?1, ?2)")
        .map_err(map_sql_error)?;
    for name in BUILTIN_PACKAGES {
        stmt.execute(params![name, env!("CARGO_PKG_VERSION")])
            .map_err(map_sql_error)?;
    }
    Ok(())
}

pub(super) fn install(connection: &Connection, name: &str, version: &str) -> Result<(), SessionError> {
    connection
        .execute(
            "INSERT INTO _remotefit_packages (name, version) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET version = excluded.version",
            params![canonical_name(name), version.trim()],
        )
        .map_err(map_sql_error)?;
    Ok(())
}

pub(super) fn uninstall(connection: &Connection, name: &str) -> Result<bool, SessionError> {
    let removed = connection
        .execute(
            "DELETE FROM _remotefit_packages WHERE name = ?1",
            params![canonical_name(name)],
        )
        .map_err(map_sql_error)?;
    Ok(removed > 0)
}

pub(super) fn list(connection: &Connection) -> Result<BTreeMap<String, String>, SessionError> {
    let mut stmt = connection
        .prepare("SELECT name, version FROM _remotefit_packages ORDER BY name")
        .map_err(map_sql_error)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(map_sql_error)?;
    let mut packages = BTreeMap::new();
    for row in rows {
        let (name, version) = row.map_err(map_sql_error)?;
        packages.insert(name, version);
    }
    Ok(packages)
}
