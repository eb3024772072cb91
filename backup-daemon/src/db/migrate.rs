use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS schedules (
  volume_name TEXT PRIMARY KEY,
  interval_hours INTEGER NOT NULL CHECK(interval_hours >= 1),
  keep_count INTEGER NOT NULL CHECK(keep_count >= 1),
  enabled INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL,
  last_run_at TEXT,
  next_run_at TEXT
);

CREATE TABLE IF NOT EXISTS settings (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[test]
    fn test_migrate_is_idempotent() {
        let (_dir, pool) = test_pool();
        migrate(&pool).unwrap();
        let conn = pool.get().unwrap();
        let mut stmt = conn.prepare("PRAGMA table_info(schedules)").unwrap();
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert!(columns.iter().any(|c| c == "next_run_at"));
    }
}
