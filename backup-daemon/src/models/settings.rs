use backup_engine::config::RepositoryConfig;
use rusqlite::{params, Connection};

const REPOSITORY_KEY: &str = "repository";

pub fn get(conn: &Connection, key: &str) -> anyhow::Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?")?;
    let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
    Ok(rows.next().and_then(|r| r.ok()))
}

pub fn set(conn: &Connection, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Repository settings saved at runtime, if any.
pub fn load_repository(conn: &Connection) -> anyhow::Result<Option<RepositoryConfig>> {
    match get(conn, REPOSITORY_KEY)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn save_repository(conn: &Connection, config: &RepositoryConfig) -> anyhow::Result<()> {
    set(conn, REPOSITORY_KEY, &serde_json::to_string(config)?)
}
