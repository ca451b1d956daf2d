use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{SpindleError, TaskConfig};
use crate::ports::{Strategy, StrategyFactory};

/// Registry of strategies (name -> factory).
///
/// Built during initialization (mutable), shared read-only afterwards, so no
/// lock is needed at run time.
#[derive(Default)]
pub struct StrategyRegistry {
    factories: HashMap<String, Arc<dyn StrategyFactory>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`. Registering the same name twice is an
    /// error rather than "last wins".
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: Arc<dyn StrategyFactory>,
    ) -> Result<(), SpindleError> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(SpindleError::DuplicateStrategy(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// A fresh strategy instance for one run of `config`.
    pub fn create(&self, config: &TaskConfig) -> Result<Box<dyn Strategy>, SpindleError> {
        let factory = self
            .factories
            .get(&config.strategy)
            .ok_or_else(|| SpindleError::UnknownStrategy(config.strategy.clone()))?;
        Ok(factory.create(config)?)
    }

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
