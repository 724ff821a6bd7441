use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::plugin::{EmbeddingProvider, LanguagePlugin, ParserFactory};
use super::regex_provider::RegexEmbeddingProvider;
use super::LanguageId;
use crate::config::{CacheSettings, resolve_language_with_wildcard};
use crate::error::{LockResultExt, ParseResult};

/// Registry mapping language ids to their plugins.
///
/// Cache nodes resolve their plugin once, when they are created, so plugins
/// registered later only affect nodes created later.
#[derive(Clone, Default)]
pub struct LanguageRegistry {
    plugins: Arc<Mutex<HashMap<LanguageId, Arc<LanguagePlugin>>>>,
    fallback_parser: Arc<Mutex<Option<Arc<dyn ParserFactory>>>>,
}

impl LanguageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the plugin for a language
    pub fn register(&self, language: impl Into<LanguageId>, plugin: LanguagePlugin) {
        self.plugins
            .lock()
            .recover_poison("registry::register")
            .insert(language.into(), Arc::new(plugin));
    }

    /// Set the parser factory for a language, keeping its embedders
    pub fn register_parser(&self, language: impl Into<LanguageId>, factory: impl ParserFactory + 'static) {
        let factory: Arc<dyn ParserFactory> = Arc::new(factory);
        self.update(language.into(), |plugin| plugin.set_parser(factory));
    }

    /// Append an embedding provider for a language
    pub fn add_embedder(&self, language: impl Into<LanguageId>, provider: impl EmbeddingProvider + 'static) {
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(provider);
        self.update(language.into(), |plugin| plugin.push_embedder(provider));
    }

    /// Parser used for languages registered without one.
    pub fn set_fallback_parser(&self, factory: impl ParserFactory + 'static) {
        *self
            .fallback_parser
            .lock()
            .recover_poison("registry::set_fallback_parser") = Some(Arc::new(factory));
    }

    /// Get the plugin for a language, with the fallback parser applied.
    pub fn get(&self, language: &LanguageId) -> Option<Arc<LanguagePlugin>> {
        let plugin = self
            .plugins
            .lock()
            .recover_poison("registry::get")
            .get(language)
            .cloned();
        let fallback = self
            .fallback_parser
            .lock()
            .recover_poison("registry::get")
            .clone();

        match (plugin, fallback) {
            (Some(plugin), Some(fallback)) if !plugin.has_parser() => {
                let mut plugin = (*plugin).clone();
                plugin.set_parser(fallback);
                Some(Arc::new(plugin))
            }
            (None, Some(fallback)) => {
                let mut plugin = LanguagePlugin::new();
                plugin.set_parser(fallback);
                Some(Arc::new(plugin))
            }
            (plugin, _) => plugin,
        }
    }

    /// Check if a language is registered
    pub fn contains(&self, language: &str) -> bool {
        self.plugins
            .lock()
            .recover_poison("registry::contains")
            .contains_key(language)
    }

    /// Get all registered language ids, sorted
    pub fn language_ids(&self) -> Vec<LanguageId> {
        let mut ids: Vec<LanguageId> = self
            .plugins
            .lock()
            .recover_poison("registry::language_ids")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Register the regex injections declared in settings.
    ///
    /// Returns the number of providers registered. A pattern that fails to
    /// compile aborts with a configuration error naming the language.
    pub fn apply_settings(&self, settings: &CacheSettings) -> ParseResult<usize> {
        let mut registered = 0;
        let mut languages: Vec<&String> = settings
            .languages
            .keys()
            .filter(|name| name.as_str() != "_")
            .collect();
        languages.sort();

        for name in languages {
            let Some(resolved) = resolve_language_with_wildcard(&settings.languages, name) else {
                continue;
            };
            for pattern in resolved.injections.unwrap_or_default() {
                let provider = RegexEmbeddingProvider::from_pattern(&pattern)?;
                self.add_embedder(name.as_str(), provider);
                registered += 1;
            }
        }

        log::info!(
            target: "nestcache::config",
            "Registered {} injection pattern(s) from settings",
            registered
        );
        Ok(registered)
    }

    fn update(&self, language: LanguageId, apply: impl FnOnce(&mut LanguagePlugin)) {
        let mut plugins = self.plugins.lock().recover_poison("registry::update");
        let mut plugin = plugins
            .get(&language)
            .map(|existing| (**existing).clone())
            .unwrap_or_default();
        apply(&mut plugin);
        plugins.insert(language, Arc::new(plugin));
    }
}
