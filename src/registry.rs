//! Name-keyed factory registry.
//!
//! Stages and input sources are created by type name so that a persisted
//! chain can be rebuilt without the caller knowing concrete types. A registry
//! maps each name to a boxed factory closure.
//!
//! Lookup failures are never fatal: `create` logs the unknown name and returns
//! `None`, leaving the caller to skip the entry and continue.

use std::collections::HashMap;

use crate::ingest::InputSource;
use crate::stage::SharedStage;

/// Boxed factory closure producing `P` from construction arguments `A`.
pub type Factory<P, A> = Box<dyn Fn(A) -> P + Send + Sync>;

/// Stage types, keyed by type name.
pub type StageRegistry = Registry<SharedStage>;

/// Input source types, constructed from a device id.
pub type SourceRegistry = Registry<Box<dyn InputSource>, String>;

/// Thread-safe map from type name to factory.
///
/// Registering a name that already exists replaces the previous factory.
pub struct Registry<P, A = ()> {
    kind: &'static str,
    factories: HashMap<String, Factory<P, A>>,
}

impl<P, A> Registry<P, A> {
    /// Create an empty registry. `kind` only labels log messages.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: HashMap::new(),
        }
    }

    /// Register a factory. The last registration for a name wins.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(A) -> P + Send + Sync + 'static,
    {
        if self
            .factories
            .insert(name.to_string(), Box::new(factory))
            .is_some()
        {
            log::debug!("{} registry: replaced factory for '{}'", self.kind, name);
        }
    }

    /// Instantiate `name`, or log an error and return `None` when unknown.
    pub fn create(&self, name: &str, args: A) -> Option<P> {
        match self.factories.get(name) {
            Some(factory) => Some(factory(args)),
            None => {
                log::error!("{} registry: type '{}' is not registered", self.kind, name);
                None
            }
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Remove a factory. Returns true when the name was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.factories.remove(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
