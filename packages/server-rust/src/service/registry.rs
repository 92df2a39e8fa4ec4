use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use microbus_core::subject::{is_valid_subject, is_valid_token};
use microbus_core::BalancingMode;
use parking_lot::RwLock;

use super::definition::MethodConfig;
use super::handler::Handler;
use super::operation::ConfigurationError;

// ---------------------------------------------------------------------------
// RegisteredMethod
// ---------------------------------------------------------------------------

/// A method that passed registration checks; its handler is guaranteed present.
pub struct RegisteredMethod {
    pub name: String,
    pub handler: Arc<dyn Handler>,
    pub config: MethodConfig,
}

impl std::fmt::Debug for RegisteredMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredMethod")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// MethodRegistry
// ---------------------------------------------------------------------------

/// Per-microservice method table.
///
/// Lookup is by name; iteration follows registration order. There is no
/// removal: the registry lives exactly as long as its microservice.
#[derive(Debug, Default)]
pub struct MethodRegistry {
    by_name: DashMap<String, Arc<RegisteredMethod>>,
    /// Registration order for deterministic endpoint derivation.
    order: RwLock<Vec<String>>,
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the name is not a single subject
    /// token or is already taken, the handler is missing, the explicit subject
    /// is malformed, or a local method carries an explicit subject.
    pub fn register(&self, name: &str, config: MethodConfig) -> Result<(), ConfigurationError> {
        if !is_valid_token(name) {
            return Err(ConfigurationError::InvalidMethodName(name.to_string()));
        }
        let Some(handler) = config.handler.clone() else {
            return Err(ConfigurationError::MissingHandler(name.to_string()));
        };
        if let Some(subject) = &config.subject {
            if config.balancing == BalancingMode::Local {
                return Err(ConfigurationError::InvalidBalancing {
                    method: name.to_string(),
                    reason: "local methods are addressed by instance id and cannot override their subject",
                });
            }
            if !is_valid_subject(subject) {
                return Err(ConfigurationError::InvalidSubject {
                    method: name.to_string(),
                    subject: subject.clone(),
                });
            }
        }

        match self.by_name.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ConfigurationError::DuplicateMethod(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RegisteredMethod {
                    name: name.to_string(),
                    handler,
                    config,
                }));
                self.order.write().push(name.to_string());
                Ok(())
            }
        }
    }

    /// Retrieve a method by name.
    pub fn get(&self, name: &str) -> Option<Arc<RegisteredMethod>> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    /// All methods in registration order.
    pub fn all(&self) -> Vec<(String, Arc<RegisteredMethod>)> {
        let order = self.order.read().clone();
        order
            .into_iter()
            .filter_map(|name| self.get(&name).map(|method| (name, method)))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
