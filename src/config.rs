pub mod defaults;
pub mod settings;
pub mod user;

pub use defaults::default_settings;
pub use settings::{CacheSettings, InjectionPattern, LanguageSettings};
pub use user::{
    UserConfigError, UserConfigResult, load_settings_file, load_user_config, user_config_path,
};

use std::collections::HashMap;
use std::path::Path;

use crate::error::ParseError;

/// Key whose settings apply to every language.
pub const WILDCARD_KEY: &str = "_";

/// Name of the project configuration file.
pub const PROJECT_CONFIG_FILE: &str = "nestcache.toml";

impl From<UserConfigError> for ParseError {
    fn from(err: UserConfigError) -> Self {
        ParseError::config(err.to_string())
    }
}

/// Resolve a language key with wildcard fallback and merging.
///
/// - If both wildcard ("_") and specific key exist: merge them (specific overrides wildcard)
/// - If only one of them exists: return it
/// - If neither exists: return None
pub fn resolve_language_with_wildcard(
    map: &HashMap<String, LanguageSettings>,
    key: &str,
) -> Option<LanguageSettings> {
    let wildcard = map.get(WILDCARD_KEY);
    let specific = map.get(key);

    match (wildcard, specific) {
        (Some(w), Some(s)) => Some(LanguageSettings {
            embeddings: s.embeddings.or(w.embeddings),
            injections: s.injections.clone().or_else(|| w.injections.clone()),
        }),
        (Some(w), None) => Some(w.clone()),
        (None, Some(s)) => Some(s.clone()),
        (None, None) => None,
    }
}

/// Merge multiple layers in order; later layers override earlier ones.
pub fn merge_all(layers: &[Option<CacheSettings>]) -> Option<CacheSettings> {
    layers.iter().cloned().reduce(merge_settings).flatten()
}

/// Merge two layers, preferring values from `primary` over `fallback`
pub fn merge_settings(
    fallback: Option<CacheSettings>,
    primary: Option<CacheSettings>,
) -> Option<CacheSettings> {
    match (fallback, primary) {
        (None, None) => None,
        (Some(settings), None) | (None, Some(settings)) => Some(settings),
        (Some(fallback), Some(primary)) => Some(CacheSettings {
            slow_cancel_limit_ms: primary.slow_cancel_limit_ms.or(fallback.slow_cancel_limit_ms),
            stale_retry_limit: primary.stale_retry_limit.or(fallback.stale_retry_limit),
            max_embedding_depth: primary.max_embedding_depth.or(fallback.max_embedding_depth),
            languages: merge_languages(fallback.languages, primary.languages),
        }),
    }
}

fn merge_languages(
    mut fallback: HashMap<String, LanguageSettings>,
    primary: HashMap<String, LanguageSettings>,
) -> HashMap<String, LanguageSettings> {
    for (key, primary_settings) in primary {
        fallback
            .entry(key)
            .and_modify(|fallback_settings| {
                fallback_settings.embeddings =
                    primary_settings.embeddings.or(fallback_settings.embeddings);
                fallback_settings.injections = primary_settings
                    .injections
                    .clone()
                    .or(fallback_settings.injections.take());
            })
            .or_insert(primary_settings);
    }
    fallback
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsEventKind {
    Info,
    Warning,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingsEvent {
    pub kind: SettingsEventKind,
    pub message: String,
}

impl SettingsEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: SettingsEventKind::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: SettingsEventKind::Warning,
            message: message.into(),
        }
    }

    /// Forward the event to the log facade.
    pub fn log(&self) {
        match self.kind {
            SettingsEventKind::Info => {
                log::info!(target: "nestcache::config", "{}", self.message)
            }
            SettingsEventKind::Warning => {
                log::warn!(target: "nestcache::config", "{}", self.message)
            }
        }
    }
}

#[derive(Debug)]
pub struct SettingsLoadOutcome {
    pub settings: CacheSettings,
    pub events: Vec<SettingsEvent>,
}

/// Load the layered settings: defaults < user < project < explicit file.
///
/// Unreadable or malformed layers are skipped and reported as warning
/// events; the remaining layers still apply.
pub fn load_settings(project_root: Option<&Path>, explicit: Option<&Path>) -> SettingsLoadOutcome {
    let mut events = Vec::new();

    let defaults = Some(default_settings());
    let user = load_user_config_with_events(&mut events);
    let project = project_root
        .map(|root| root.join(PROJECT_CONFIG_FILE))
        .filter(|path| path.exists())
        .and_then(|path| load_file_with_events(&path, &mut events));
    let explicit = explicit.and_then(|path| load_file_with_events(path, &mut events));

    let settings = merge_all(&[defaults, user, project, explicit]).unwrap_or_else(default_settings);
    SettingsLoadOutcome { settings, events }
}

fn load_user_config_with_events(events: &mut Vec<SettingsEvent>) -> Option<CacheSettings> {
    match load_user_config() {
        Ok(Some(settings)) => {
            events.push(SettingsEvent::info("Loaded user config"));
            Some(settings)
        }
        // No user config file exists - this is fine (zero-config experience)
        Ok(None) => None,
        Err(err) => {
            events.push(SettingsEvent::warning(format!(
                "Failed to load user config: {}",
                err
            )));
            None
        }
    }
}

fn load_file_with_events(path: &Path, events: &mut Vec<SettingsEvent>) -> Option<CacheSettings> {
    match load_settings_file(path) {
        Ok(settings) => {
            events.push(SettingsEvent::info(format!(
                "Loaded config file: {}",
                path.display()
            )));
            Some(settings)
        }
        Err(err) => {
            events.push(SettingsEvent::warning(err.to_string()));
            None
        }
    }
}
