//! Tree config sync bookkeeping

use diesel::prelude::*;

use super::diesel_schema::progression_sync_metadata;
use super::models::SyncMetadata;
use crate::error::ProgressionError;

pub fn get_sync_metadata(
    conn: &mut SqliteConnection,
    config_name: &str,
) -> Result<Option<SyncMetadata>, ProgressionError> {
    progression_sync_metadata::table
        .find(config_name)
        .first(conn)
        .optional()
        .map_err(|e| ProgressionError::Internal(format!("Query failed: {}", e)))
}

pub fn upsert_sync_metadata(
    conn: &mut SqliteConnection,
    metadata: &SyncMetadata,
) -> Result<(), ProgressionError> {
    diesel::replace_into(progression_sync_metadata::table)
        .values(metadata)
        .execute(conn)
        .map_err(|e| ProgressionError::Internal(format!("Sync metadata upsert failed: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    #[test]
    fn test_upsert_replaces() {
        let (_dir, db) = test_db();
        let mut conn = db.conn().unwrap();
        assert!(get_sync_metadata(&mut conn, "tree.json").unwrap().is_none());

        let mut meta = SyncMetadata {
            config_name: "tree.json".into(),
            last_sync_time: "2024-01-01T00:00:00.000000Z".into(),
            file_hash: "abc".into(),
            file_mod_time: "2024-01-01T00:00:00.000000Z".into(),
        };
        upsert_sync_metadata(&mut conn, &meta).unwrap();
        meta.file_hash = "def".into();
        upsert_sync_metadata(&mut conn, &meta).unwrap();

        assert_eq!(get_sync_metadata(&mut conn, "tree.json").unwrap().unwrap().file_hash, "def");
    }
}
