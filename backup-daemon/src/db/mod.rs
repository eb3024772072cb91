pub mod connection;
pub mod migrate;

#[cfg(test)]
pub fn test_pool() -> (tempfile::TempDir, connection::DbPool) {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("test.db");
    let pool = connection::create_pool(&path.to_string_lossy()).unwrap();
    migrate::migrate(&pool).unwrap();
    (dir, pool)
}
