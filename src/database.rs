//! Database registration and ordered migrations.
//!
//! The core only forwards [`DatabaseEntry`] values; everything below the
//! [`DatabaseManager`] contract is pluggable. [`Databases`] is the stock
//! manager: one [`Connector`] per backend type tag produces a [`Backend`],
//! and migrations are plain statements the backend executes in order.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::handler::BoxFuture;

/// One versioned migration step.
#[derive(Debug, Clone, Deserialize)]
pub struct Migration {
    pub version: u64,
    #[serde(alias = "up")]
    pub script: String,
}

/// A `databases[]` entry of a descriptor document.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseEntry {
    pub name: String,
    #[serde(rename = "type", alias = "backendType")]
    pub backend: String,
    #[serde(default)]
    pub connection: Value,
    #[serde(default)]
    pub migrations: Vec<Migration>,
}

/// What the interpreter and plugins see of database management.
pub trait DatabaseManager: Send + Sync + 'static {
    /// Connects `entry` and keeps it for later migrations.
    fn register_database(&self, entry: DatabaseEntry) -> BoxFuture<'_, Result<(), Error>>;

    /// Applies pending migrations of every registered database.
    fn migrate_all(&self) -> BoxFuture<'_, Result<(), Error>>;
}

impl<T: DatabaseManager + ?Sized> DatabaseManager for Arc<T> {
    fn register_database(&self, entry: DatabaseEntry) -> BoxFuture<'_, Result<(), Error>> {
        (**self).register_database(entry)
    }

    fn migrate_all(&self) -> BoxFuture<'_, Result<(), Error>> {
        (**self).migrate_all()
    }
}

/// A live connection able to run migration scripts and queries.
pub trait Backend: Send + Sync + 'static {
    fn migrate<'a>(&'a self, migration: &'a Migration) -> BoxFuture<'a, Result<(), Error>>;

    fn query<'a>(&'a self, statement: &'a str) -> BoxFuture<'a, Result<Value, Error>>;
}

/// Opens backends for one type tag.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, entry: &'a DatabaseEntry) -> BoxFuture<'a, Result<Arc<dyn Backend>, Error>>;
}

// ── Databases ─────────────────────────────────────────────────────────────────

/// A registered database.
pub struct Database {
    name: String,
    backend_type: String,
    backend: Arc<dyn Backend>,
    migrations: Vec<Migration>,
    version: AtomicU64,
}

impl Database {
    pub fn name(&self) -> &str { &self.name }
    pub fn backend_type(&self) -> &str { &self.backend_type }

    /// Version of the last migration applied, `0` before any.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub async fn query(&self, statement: &str) -> Result<Value, Error> {
        self.backend.query(statement).await
    }

    /// Runs pending migrations in version order, stopping at the first failure.
    async fn migrate(&self) -> Result<(), Error> {
        for migration in &self.migrations {
            if migration.version <= self.version() {
                continue;
            }
            info!(database = %self.name, version = migration.version, "applying migration");
            if let Err(e) = self.backend.migrate(migration).await {
                error!(database = %self.name, version = migration.version, error = %e, "migration failed");
                return Err(Error::database(
                    &self.name,
                    format!("migration {} failed: {e}", migration.version),
                ));
            }
            self.version.store(migration.version, Ordering::Release);
        }
        Ok(())
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("backend_type", &self.backend_type)
            .field("version", &self.version())
            .finish()
    }
}

/// The stock [`DatabaseManager`].
///
/// Ships with the `memory` backend; register real drivers with
/// [`connector`](Databases::connector).
pub struct Databases {
    connectors: HashMap<String, Arc<dyn Connector>>,
    registered: ArcSwap<Vec<Arc<Database>>>,
    migrating: Mutex<()>,
}

impl Default for Databases {
    fn default() -> Self {
        Self::new()
    }
}

impl Databases {
    pub fn new() -> Self {
        Self {
            connectors: HashMap::new(),
            registered: ArcSwap::default(),
            migrating: Mutex::new(()),
        }
        .connector("memory", MemoryConnector)
    }

    /// Serves entries whose `type` is `backend_type`.
    pub fn connector(mut self, backend_type: impl Into<String>, connector: impl Connector) -> Self {
        self.connectors.insert(backend_type.into(), Arc::new(connector));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<Database>> {
        self.registered.load().iter().find(|db| db.name == name).cloned()
    }

    /// Registered database names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.registered.load().iter().map(|db| db.name.clone()).collect()
    }

    async fn register(&self, entry: DatabaseEntry) -> Result<(), Error> {
        if entry.name.is_empty() || entry.backend.is_empty() || entry.connection.is_null() {
            return Err(Error::configuration(
                "database entries need `name`, `type` and `connection`",
            ));
        }
        let mut migrations = entry.migrations.clone();
        migrations.sort_by_key(|m| m.version);
        if let Some(pair) = migrations.windows(2).find(|pair| pair[0].version == pair[1].version) {
            return Err(Error::configuration(format!(
                "database `{}` lists migration version {} twice",
                entry.name, pair[0].version
            )));
        }
        let connector = self.connectors.get(&entry.backend).ok_or_else(|| {
            Error::database(&entry.name, format!("unsupported backend `{}`", entry.backend))
        })?;
        let backend = connector.connect(&entry).await?;
        info!(database = %entry.name, backend = %entry.backend, "database connected");

        let database = Arc::new(Database {
            name: entry.name,
            backend_type: entry.backend,
            backend,
            migrations,
            version: AtomicU64::new(0),
        });
        self.registered.rcu(|registered| {
            let mut next: Vec<_> = registered.iter().filter(|db| db.name != database.name).cloned().collect();
            if next.len() != registered.len() {
                warn!(database = %database.name, "database re-registered, replacing");
            }
            next.push(Arc::clone(&database));
            next
        });
        Ok(())
    }

    /// Migrates one database by name.
    pub async fn migrate(&self, name: &str) -> Result<(), Error> {
        let database = self
            .get(name)
            .ok_or_else(|| Error::database(name, "not registered"))?;
        let _running = self.migrating.lock().await;
        database.migrate().await
    }

    async fn migrate_each(&self) -> Result<(), Error> {
        let _running = self.migrating.lock().await;
        let mut first_failure = None;
        for database in self.registered.load_full().iter() {
            if let Err(e) = database.migrate().await {
                first_failure.get_or_insert(e);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }
}

impl DatabaseManager for Databases {
    fn register_database(&self, entry: DatabaseEntry) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.register(entry))
    }

    /// Every database is attempted; the first failure is returned.
    fn migrate_all(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.migrate_each())
    }
}

// ── Memory backend ────────────────────────────────────────────────────────────

/// Connector for the `memory` type tag.
pub struct MemoryConnector;

impl Connector for MemoryConnector {
    fn connect<'a>(&'a self, _entry: &'a DatabaseEntry) -> BoxFuture<'a, Result<Arc<dyn Backend>, Error>> {
        Box::pin(async { Ok(Arc::new(MemoryBackend::default()) as Arc<dyn Backend>) })
    }
}

/// A key/value store driven by line-oriented statements:
///
/// ```text
/// SET <key> <json value>
/// DEL <key>
/// GET <key>      (query only)
/// KEYS           (query only)
/// ```
///
/// A migration script may hold several statements, one per line or separated
/// by `;`. Unknown statements fail.
#[derive(Default)]
pub struct MemoryBackend {
    data: DashMap<String, Value>,
}

impl MemoryBackend {
    fn execute(&self, statement: &str) -> Result<Value, String> {
        let mut words = statement.trim().splitn(3, char::is_whitespace);
        let verb = words.next().unwrap_or_default().to_ascii_uppercase();
        let key = words.next().map(str::trim).filter(|k| !k.is_empty());
        match (verb.as_str(), key) {
            ("SET", Some(key)) => {
                let raw = words.next().unwrap_or_default().trim();
                let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()));
                self.data.insert(key.to_owned(), value);
                Ok(Value::Null)
            }
            ("DEL", Some(key)) => Ok(self.data.remove(key).map(|(_, v)| v).unwrap_or_default()),
            ("GET", Some(key)) => Ok(self.data.get(key).map(|v| v.value().clone()).unwrap_or_default()),
            ("KEYS", None) => {
                let mut keys: Vec<String> = self.data.iter().map(|e| e.key().clone()).collect();
                keys.sort();
                Ok(Value::from(keys))
            }
            _ => Err(format!("unrecognized statement `{}`", statement.trim())),
        }
    }
}

impl Backend for MemoryBackend {
    fn migrate<'a>(&'a self, migration: &'a Migration) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            migration
                .script
                .split([';', '\n'])
                .filter(|s| !s.trim().is_empty())
                .try_for_each(|statement| self.execute(statement).map(drop))
                .map_err(|reason| Error::database("memory", reason))
        })
    }

    fn query<'a>(&'a self, statement: &'a str) -> BoxFuture<'a, Result<Value, Error>> {
        Box::pin(async move { self.execute(statement).map_err(|reason| Error::database("memory", reason)) })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(yaml: &str) -> DatabaseEntry {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn entries_accept_field_aliases() {
        let db = entry(
            "name: main\nbackendType: memory\nconnection: ':memory:'\nmigrations:\n  - {version: 1, up: 'SET a 1'}\n",
        );
        assert_eq!(db.backend, "memory");
        assert_eq!(db.migrations[0].script, "SET a 1");
    }

    #[tokio::test]
    async fn migrations_apply_in_order_and_record_the_version() {
        let databases = Databases::new();
        databases
            .register_database(entry(
                "name: shop\ntype: memory\nconnection: ':memory:'\nmigrations:\n  - {version: 1, script: 'SET products []'}\n  - {version: 2, script: \"SET products [1, 2]; SET open true\"}\n",
            ))
            .await
            .unwrap();

        databases.migrate_all().await.unwrap();
        let shop = databases.get("shop").unwrap();
        assert_eq!(shop.version(), 2);
        assert_eq!(shop.query("GET products").await.unwrap(), json!([1, 2]));
        assert_eq!(shop.query("KEYS").await.unwrap(), json!(["open", "products"]));

        // Already-applied versions are not replayed.
        shop.query("SET products []").await.unwrap();
        databases.migrate_all().await.unwrap();
        assert_eq!(shop.query("GET products").await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn migrations_listed_out_of_order_run_by_version() {
        let databases = Databases::new();
        databases
            .register_database(entry(
                "name: main\ntype: memory\nconnection: x\nmigrations:\n  - {version: 2, script: 'SET b 2'}\n  - {version: 1, script: 'SET a 1'}\n",
            ))
            .await
            .unwrap();

        databases.migrate_all().await.unwrap();
        let main = databases.get("main").unwrap();
        assert_eq!(main.version(), 2);
        assert_eq!(main.query("GET a").await.unwrap(), json!(1));
        assert_eq!(main.query("GET b").await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn repeated_migration_versions_are_refused() {
        let databases = Databases::new();
        let result = databases
            .register_database(entry(
                "name: main\ntype: memory\nconnection: x\nmigrations:\n  - {version: 1, script: 'SET a 1'}\n  - {version: 1, script: 'SET a 2'}\n",
            ))
            .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert!(databases.names().is_empty());
    }

    #[tokio::test]
    async fn a_failed_migration_stops_that_database_only() {
        let databases = Databases::new();
        databases
            .register_database(entry(
                "name: broken\ntype: memory\nconnection: x\nmigrations:\n  - {version: 1, script: 'SET a 1'}\n  - {version: 2, script: 'DROP TABLE a'}\n  - {version: 3, script: 'SET c 3'}\n",
            ))
            .await
            .unwrap();
        databases
            .register_database(entry(
                "name: fine\ntype: memory\nconnection: x\nmigrations:\n  - {version: 7, script: 'SET b 2'}\n",
            ))
            .await
            .unwrap();

        let result = databases.migrate_all().await;
        assert!(matches!(result, Err(Error::Database { ref name, .. }) if name == "broken"));
        let broken = databases.get("broken").unwrap();
        assert_eq!(broken.version(), 1);
        assert_eq!(broken.query("GET c").await.unwrap(), Value::Null);
        assert_eq!(databases.get("fine").unwrap().version(), 7);
    }

    #[tokio::test]
    async fn invalid_entries_are_refused() {
        let databases = Databases::new();
        let unsupported = databases
            .register_database(entry("name: x\ntype: oracle\nconnection: x\n"))
            .await;
        assert!(matches!(unsupported, Err(Error::Database { .. })));

        let no_connection = databases.register_database(entry("name: x\ntype: memory\n")).await;
        assert!(matches!(no_connection, Err(Error::Configuration(_))));
        assert!(databases.names().is_empty());
    }

    #[tokio::test]
    async fn re_registration_replaces() {
        let databases = Databases::new();
        for _ in 0..2 {
            databases
                .register_database(entry("name: main\ntype: memory\nconnection: x\n"))
                .await
                .unwrap();
        }
        assert_eq!(databases.names(), ["main"]);
    }
}
