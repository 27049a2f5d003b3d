//! Keyword registry: name-keyed lookup with conflict detection

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::builtin;
use super::error::KeywordError;
use super::traits::{Category, Keyword};

/// Thread-safe name → keyword lookup
///
/// The registry is injected into the step pipeline rather than accessed
/// through a process-wide global; a node builds one at startup (usually
/// via [`KeywordRegistry::with_builtins`]) and shares it by `Arc`.
#[derive(Default)]
pub struct KeywordRegistry {
    inner: RwLock<HashMap<String, Arc<dyn Keyword>>>,
}

impl KeywordRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with every builtin keyword
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for kw in builtin::all() {
            // builtin names are distinct by construction
            let _ = registry.register(kw);
        }
        registry
    }

    /// Register a keyword; fails on an empty or duplicate name
    pub fn register(&self, keyword: Arc<dyn Keyword>) -> Result<(), KeywordError> {
        let name = keyword.name();
        if name.is_empty() {
            return Err(KeywordError::EmptyName);
        }
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.contains_key(name) {
            return Err(KeywordError::AlreadyRegistered { name: name.to_string() });
        }
        inner.insert(name.to_string(), keyword);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Keyword>, KeywordError> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| KeywordError::NotFound { name: name.to_string() })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Names of keywords in a category; `None` lists everything
    pub fn list(&self, category: Option<Category>) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = inner
            .values()
            .filter(|kw| category.is_none_or(|c| kw.category() == c))
            .map(|kw| kw.name().to_string())
            .collect();
        names.sort();
        names
    }
}
