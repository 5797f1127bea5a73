pub mod sql;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::{AppError, Result};

/// A single result row, column name to textual value. NULL columns are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Row(BTreeMap<String, String>);

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy when assembling rows by hand.
    pub fn with(mut self, column: &str, value: &str) -> Self {
        self.0.insert(column.to_string(), value.to_string());
        self
    }

    pub fn insert(&mut self, column: String, value: String) {
        self.0.insert(column, value);
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl std::fmt::Display for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fields = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{{{fields}}}")
    }
}

/// A named backing store.
///
/// Statements are referenced by key; the adapter owns the query text.
#[async_trait]
pub trait StoreHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Run a read statement and return its first row, if any.
    async fn query_one(&self, statement: &str, params: &[String]) -> Result<Option<Row>>;

    /// Run a write statement and return the number of affected rows.
    async fn execute(&self, statement: &str, params: &[String]) -> Result<u64>;

    /// Cheap liveness check.
    async fn is_available(&self) -> bool;

    /// Release the underlying connections.
    async fn close(&self) {}
}

/// Store handles keyed by store name.
pub struct StoreRegistry {
    stores: HashMap<String, Arc<dyn StoreHandle>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self {
            stores: HashMap::new(),
        }
    }

    /// Build one SQL store per configured entry. Connections open lazily on first use.
    pub fn from_config(configs: &HashMap<String, StoreConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for (name, config) in configs {
            let store = sql::SqlStore::connect_lazy(name, config)?;
            registry.register(Arc::new(store));
        }
        Ok(registry)
    }

    pub fn register(&mut self, store: Arc<dyn StoreHandle>) {
        tracing::debug!(store = store.name(), "Registering store");
        self.stores.insert(store.name().to_string(), store);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StoreHandle>> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::Config(format!("Unknown store: {name}")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.keys().cloned().collect();
        names.sort();
        names
    }

    /// Liveness of every registered store, sorted by name.
    pub async fn check_all(&self) -> Vec<(String, bool)> {
        let mut report = Vec::with_capacity(self.stores.len());
        for name in self.names() {
            let available = match self.stores.get(&name) {
                Some(store) => store.is_available().await,
                None => false,
            };
            if !available {
                tracing::warn!(store = %name, "Store is not reachable");
            }
            report.push((name, available));
        }
        report
    }

    pub async fn close_all(&self) {
        for (name, store) in &self.stores {
            tracing::debug!(store = %name, "Closing store");
            store.close().await;
        }
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}
