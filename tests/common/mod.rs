//! Shared fixtures: seeded SQLite stores and test configs.

#![allow(dead_code)]

use din_sql::catalog::SqliteStore;
use din_sql::config::Config;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempDir;

/// Create a SQLite file at `path` and run `statements` against it.
pub async fn seed_store(path: &Path, statements: &[&str]) {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .unwrap()
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    for statement in statements {
        sqlx::query(statement).execute(&pool).await.unwrap();
    }
    pool.close().await;
}

pub const ADS_TABLES: &[&str] = &[
    "CREATE TABLE facebook_ads (date TEXT NOT NULL, facebook_clicks INTEGER NOT NULL)",
    "CREATE TABLE google_ads (date TEXT NOT NULL, google_clicks INTEGER NOT NULL)",
    "INSERT INTO facebook_ads VALUES ('2024-01-01', 120), ('2024-01-02', 95)",
    "INSERT INTO google_ads VALUES ('2024-01-01', 40), ('2024-01-02', 61)",
];

pub const CLASSROOM_TABLE: &[&str] = &[
    "CREATE TABLE classroom (building TEXT NOT NULL, room_number TEXT NOT NULL, capacity INTEGER NOT NULL)",
    "INSERT INTO classroom VALUES ('Packard', '101', 500), ('Painter', '514', 10), ('Taylor', '3128', 70)",
];

/// Seed a store in `tmp` and open it read-only.
pub async fn store_with(tmp: &TempDir, statements: &[&str]) -> Arc<SqliteStore> {
    let path = tmp.path().join("warehouse.sqlite");
    seed_store(&path, statements).await;
    Arc::new(SqliteStore::open(&path).await.unwrap())
}

/// Config pointing at `<tmp>/data/din.sqlite` and `<tmp>/warehouse.sqlite`.
pub fn test_config(tmp: &TempDir) -> Config {
    toml::from_str(&config_toml(tmp.path())).unwrap()
}

pub fn config_toml(root: &Path) -> String {
    format!(
        r#"[db]
path = "{root}/data/din.sqlite"

[store]
path = "{root}/warehouse.sqlite"

[pipeline]
max_repair_attempts = 3
"#,
        root = root.display()
    )
}

pub fn tables(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

pub fn store_path(tmp: &TempDir) -> PathBuf {
    tmp.path().join("warehouse.sqlite")
}
