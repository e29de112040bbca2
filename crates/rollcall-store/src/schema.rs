//! `user_version`-driven schema migrations.

use crate::StoreError;
use rusqlite::{Connection, Transaction};

const CURRENT_SCHEMA_VERSION: i32 = 1;

pub(crate) fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    while version < CURRENT_SCHEMA_VERSION {
        let next = version + 1;
        apply_migration(&tx, next)?;
        version = next;
    }
    tx.pragma_update(None, "user_version", CURRENT_SCHEMA_VERSION)?;
    tx.commit()?;

    Ok(())
}

fn apply_migration(tx: &Transaction<'_>, version: i32) -> Result<(), StoreError> {
    match version {
        1 => {
            tx.execute_batch(include_str!("schema_v1.sql"))?;
            Ok(())
        }
        other => Err(StoreError::UnknownMigration(other)),
    }
}
