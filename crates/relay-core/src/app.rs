//! Tenant applications.
//!
//! Every connection, channel and REST call belongs to exactly one
//! [`Application`]. Applications are loaded once at startup and never change
//! afterwards, so the registry needs no synchronization.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Application identifier.
pub type AppId = String;

/// Registry construction errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppRegistryError {
    /// Two applications share an id.
    #[error("Duplicate application id: {0}")]
    DuplicateId(String),

    /// Two applications share a key.
    #[error("Duplicate application key: {0}")]
    DuplicateKey(String),
}

/// An isolated tenant served by this process.
#[derive(Clone, PartialEq, Eq)]
pub struct Application {
    id: AppId,
    key: String,
    secret: String,
    name: String,
    capacity: usize,
    client_messages_enabled: bool,
}

impl Application {
    /// Create an application with unlimited capacity and client messages disabled.
    #[must_use]
    pub fn new(id: impl Into<AppId>, key: impl Into<String>, secret: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            key: key.into(),
            secret: secret.into(),
            capacity: 0,
            client_messages_enabled: false,
        }
    }

    /// Set the display name. Empty names are ignored.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.is_empty() {
            self.name = name;
        }
        self
    }

    /// Set the maximum number of concurrent connections (0 = unlimited).
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Allow clients to relay `client-` events to each other.
    #[must_use]
    pub fn with_client_messages(mut self, enabled: bool) -> Self {
        self.client_messages_enabled = enabled;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Public key used in connection URLs and authorization tokens.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Signing secret. Never sent to clients.
    #[must_use]
    pub fn secret(&self) -> &str {
        &self.secret
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum concurrent connections, `None` when unlimited.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        (self.capacity > 0).then_some(self.capacity)
    }

    #[must_use]
    pub fn client_messages_enabled(&self) -> bool {
        self.client_messages_enabled
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("client_messages_enabled", &self.client_messages_enabled)
            .finish()
    }
}

/// Lookup of tenant applications.
pub trait AppRegistry: Send + Sync {
    /// All registered applications.
    fn all(&self) -> Vec<Arc<Application>>;

    /// Find an application by id.
    fn find_by_id(&self, id: &str) -> Option<Arc<Application>>;

    /// Find an application by its public key.
    fn find_by_key(&self, key: &str) -> Option<Arc<Application>>;
}

/// Registry backed by a fixed set of applications, indexed by id and key.
#[derive(Debug, Default)]
pub struct StaticAppRegistry {
    by_id: HashMap<AppId, Arc<Application>>,
    by_key: HashMap<String, Arc<Application>>,
}

impl StaticAppRegistry {
    /// Build a registry.
    ///
    /// # Errors
    ///
    /// Returns an error if two applications share an id or a key.
    pub fn new(apps: impl IntoIterator<Item = Application>) -> Result<Self, AppRegistryError> {
        let mut registry = Self::default();

        for app in apps {
            if registry.by_id.contains_key(app.id()) {
                return Err(AppRegistryError::DuplicateId(app.id().to_string()));
            }
            if registry.by_key.contains_key(app.key()) {
                return Err(AppRegistryError::DuplicateKey(app.key().to_string()));
            }

            let app = Arc::new(app);
            registry.by_key.insert(app.key().to_string(), Arc::clone(&app));
            registry.by_id.insert(app.id().to_string(), app);
        }

        Ok(registry)
    }

    /// Number of registered applications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl AppRegistry for StaticAppRegistry {
    fn all(&self) -> Vec<Arc<Application>> {
        self.by_id.values().cloned().collect()
    }

    fn find_by_id(&self, id: &str) -> Option<Arc<Application>> {
        self.by_id.get(id).cloned()
    }

    fn find_by_key(&self, key: &str) -> Option<Arc<Application>> {
        self.by_key.get(key).cloned()
    }
}
