use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::modes::ModeDescriptor;
use crate::storage::check_mode_name;

/// Mode configuration errors; always fatal, raised before any record is processed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("mode '{0}' is already registered")]
    Duplicate(String),

    #[error("unknown mode '{0}'")]
    Unknown(String),

    #[error("mode '{mode}' reads the output of '{missing}', which is not registered")]
    BrokenChain { mode: String, missing: String },

    #[error("input chain of mode '{0}' loops back on itself")]
    Cycle(String),

    #[error("mode name '{0}' must not contain path separators or '..'")]
    InvalidName(String),
}

/// Name → descriptor mapping, filled once at start-up and read-only afterwards
#[derive(Debug, Default)]
pub struct ModeRegistry {
    modes: HashMap<String, ModeDescriptor>,
}

impl ModeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a mode; its input mode may be registered later
    pub fn register(&mut self, descriptor: ModeDescriptor) -> Result<(), RegistryError> {
        let name = descriptor.name().to_string();
        if check_mode_name(&name).is_err() {
            return Err(RegistryError::InvalidName(name));
        }
        if self.modes.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }

        debug!("Registered mode: {:?}", descriptor);
        self.modes.insert(name, descriptor);
        Ok(())
    }

    /// Chainable form of [`register`](Self::register)
    pub fn with(mut self, descriptor: ModeDescriptor) -> Result<Self, RegistryError> {
        self.register(descriptor)?;
        Ok(self)
    }

    pub fn resolve(&self, name: &str) -> Result<&ModeDescriptor, RegistryError> {
        self.modes
            .get(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))
    }

    /// Walk `input_mode` links from `name` up to its producer.
    ///
    /// Returns the chain root-first, ending with `name` itself.
    pub fn validate_chain(&self, name: &str) -> Result<Vec<&ModeDescriptor>, RegistryError> {
        let mut current = self.resolve(name)?;
        let mut chain = vec![current];
        let mut seen = HashSet::from([name.to_string()]);

        while let Some(input) = current.input_mode() {
            if !seen.insert(input.to_string()) {
                return Err(RegistryError::Cycle(name.to_string()));
            }

            let parent = self.modes.get(input).ok_or_else(|| RegistryError::BrokenChain {
                mode: current.name().to_string(),
                missing: input.to_string(),
            })?;
            chain.push(parent);
            current = parent;
        }

        chain.reverse();
        Ok(chain)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.modes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::context::ModeContext;
    use crate::crawler::errors::ModeError;
    use crate::modes::{Document, Producer, Transformer};
    use async_trait::async_trait;

    struct Nothing;

    #[async_trait]
    impl Producer for Nothing {
        async fn produce(&self, _ctx: &mut ModeContext<'_>) -> Result<Vec<Document>, ModeError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl Transformer for Nothing {
        async fn transform(
            &self,
            _ctx: &mut ModeContext<'_>,
            input: Document,
        ) -> Result<Vec<Document>, ModeError> {
            Ok(vec![input])
        }
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ModeRegistry::new();
        registry.register(ModeDescriptor::producer("cities", Nothing)).unwrap();

        assert_eq!(
            registry.register(ModeDescriptor::producer("cities", Nothing)),
            Err(RegistryError::Duplicate("cities".into()))
        );
    }

    #[test]
    fn test_names_that_leave_the_output_dir_are_refused() {
        let mut registry = ModeRegistry::new();

        for name in ["../escape", "nested/mode", "..", ""] {
            assert_eq!(
                registry.register(ModeDescriptor::producer(name, Nothing)),
                Err(RegistryError::InvalidName(name.into()))
            );
        }
        assert!(registry.names().is_empty());
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = ModeRegistry::new();
        assert_eq!(
            registry.resolve("cities").unwrap_err(),
            RegistryError::Unknown("cities".into())
        );
    }

    #[test]
    fn test_forward_references_resolve_at_validation() {
        let mut registry = ModeRegistry::new();
        // Registered before the mode it reads from
        registry
            .register(ModeDescriptor::transformer("details", "listing", Nothing))
            .unwrap();
        registry
            .register(ModeDescriptor::transformer("listing", "cities", Nothing))
            .unwrap();
        registry.register(ModeDescriptor::producer("cities", Nothing)).unwrap();

        let chain: Vec<&str> = registry
            .validate_chain("details")
            .unwrap()
            .into_iter()
            .map(|m| m.name())
            .collect();
        assert_eq!(chain, vec!["cities", "listing", "details"]);
    }

    #[test]
    fn test_broken_chain() {
        let registry = ModeRegistry::new()
            .with(ModeDescriptor::transformer("details", "listing", Nothing))
            .unwrap();

        assert_eq!(
            registry.validate_chain("details").unwrap_err(),
            RegistryError::BrokenChain {
                mode: "details".into(),
                missing: "listing".into()
            }
        );
    }

    #[test]
    fn test_cycle_is_reported() {
        let registry = ModeRegistry::new()
            .with(ModeDescriptor::transformer("a", "b", Nothing))
            .unwrap()
            .with(ModeDescriptor::transformer("b", "a", Nothing))
            .unwrap();

        assert_eq!(
            registry.validate_chain("a").unwrap_err(),
            RegistryError::Cycle("a".into())
        );
    }

    #[test]
    fn test_names_are_sorted() {
        let registry = ModeRegistry::new()
            .with(ModeDescriptor::producer("seeds", Nothing))
            .unwrap()
            .with(ModeDescriptor::transformer("links", "seeds", Nothing))
            .unwrap();

        assert_eq!(registry.names(), vec!["links", "seeds"]);
    }
}
