//! Explicit builder for microservice definitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use microbus_core::{default_method_name, BalancingMode};

use super::handler::{Handler, Middleware, Validator};
use super::operation::ConfigurationError;
use super::registry::MethodRegistry;

// ---------------------------------------------------------------------------
// MethodConfig
// ---------------------------------------------------------------------------

/// Configuration of one callable method.
#[derive(Clone, Default)]
pub struct MethodConfig {
    pub handler: Option<Arc<dyn Handler>>,
    /// Explicit subject, used verbatim instead of the derived one.
    pub subject: Option<String>,
    pub metadata: HashMap<String, String>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub post_middleware: Vec<Arc<dyn Middleware>>,
    pub balancing: BalancingMode,
    pub validator: Option<Arc<dyn Validator>>,
}

impl MethodConfig {
    #[must_use]
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self {
            handler: Some(handler),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = Some(handler);
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    #[must_use]
    pub fn post_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.post_middleware.push(middleware);
        self
    }

    #[must_use]
    pub fn balancing(mut self, balancing: BalancingMode) -> Self {
        self.balancing = balancing;
        self
    }

    #[must_use]
    pub fn unbalanced(self) -> Self {
        self.balancing(BalancingMode::Unbalanced)
    }

    #[must_use]
    pub fn local(self) -> Self {
        self.balancing(BalancingMode::Local)
    }

    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }
}

impl fmt::Debug for MethodConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodConfig")
            .field("has_handler", &self.handler.is_some())
            .field("subject", &self.subject)
            .field("metadata", &self.metadata)
            .field("middleware", &self.middleware.len())
            .field("post_middleware", &self.post_middleware.len())
            .field("balancing", &self.balancing)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MicroserviceConfig
// ---------------------------------------------------------------------------

/// A complete, validated microservice definition.
#[derive(Debug)]
pub struct MicroserviceConfig {
    pub name: String,
    pub version: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
    pub methods: MethodRegistry,
}

impl MicroserviceConfig {
    pub fn builder(name: impl Into<String>) -> MicroserviceBuilder {
        MicroserviceBuilder {
            name: name.into(),
            version: "0.0.0".to_string(),
            description: String::new(),
            metadata: HashMap::new(),
            methods: Vec::new(),
        }
    }
}

/// Collects a definition; all validation happens in [`MicroserviceBuilder::build`].
#[derive(Debug)]
pub struct MicroserviceBuilder {
    name: String,
    version: String,
    description: String,
    metadata: HashMap<String, String>,
    methods: Vec<(String, MethodConfig)>,
}

impl MicroserviceBuilder {
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Adds a method under the default wire name derived from `identifier`.
    #[must_use]
    pub fn method(mut self, identifier: &str, config: MethodConfig) -> Self {
        self.methods.push((default_method_name(identifier), config));
        self
    }

    /// Validates the service name and registers every method in order.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigurationError`] encountered.
    pub fn build(self) -> Result<MicroserviceConfig, ConfigurationError> {
        if !microbus_core::subject::is_valid_service_name(&self.name) {
            return Err(ConfigurationError::InvalidServiceName(self.name));
        }
        let methods = MethodRegistry::new();
        for (name, config) in self.methods {
            methods.register(&name, config)?;
        }
        Ok(MicroserviceConfig {
            name: self.name,
            version: self.version,
            description: self.description,
            metadata: self.metadata,
            methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::handler::handler_fn;
    use crate::service::Request;

    fn echo() -> Arc<dyn Handler> {
        handler_fn(|req: Request| async move { Ok(req.payload) })
    }

    #[test]
    fn builder_collects_methods_in_order() {
        let config = MicroserviceConfig::builder("echo")
            .version("1.2.3")
            .description("echoes")
            .metadata("team", "core")
            .method("say", MethodConfig::new(echo()))
            .method("r#loop", MethodConfig::new(echo()).unbalanced())
            .build()
            .unwrap();

        assert_eq!(config.version, "1.2.3");
        let names: Vec<String> = config.methods.all().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["say", "loop"]);
    }

    #[test]
    fn invalid_service_name_is_rejected() {
        let err = MicroserviceConfig::builder("bad.name").build().unwrap_err();
        assert_eq!(err, ConfigurationError::InvalidServiceName("bad.name".to_string()));
    }

    #[test]
    fn default_version_is_zero() {
        let config = MicroserviceConfig::builder("echo").build().unwrap();
        assert_eq!(config.version, "0.0.0");
        assert!(config.methods.is_empty());
    }
}
