use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::extract::ClassifierThresholds;
use crate::languages::DEFAULT_LANGUAGE;
use crate::providers::RetryPolicy;
use crate::render::RenderSettings;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Register name to guidance text for the system prompt.
    pub formally: HashMap<String, String>,
    pub translation: TranslationSettings,
    pub classifier: ClassifierThresholds,
    pub render: RenderSettings,
    pub validation: ValidationSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranslationSettings {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub lang: String,
    pub formality: String,
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub page_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            base_url: None,
            lang: DEFAULT_LANGUAGE.to_string(),
            formality: "academic".to_string(),
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            page_delay_ms: 1_000,
            timeout_secs: 120,
        }
    }
}

impl TranslationSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub coverage_threshold: f64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            coverage_threshold: 0.95,
        }
    }
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    ensure_home_settings_file()?;

    let mut ordered_paths = Vec::new();
    ordered_paths.push(PathBuf::from("settings.toml"));
    ordered_paths.push(PathBuf::from("settings.local.toml"));

    if let Some(home) = home_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    let mut merged = builtin_table()?;
    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            let parsed: toml::Table = toml::from_str(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
            merge_table(&mut merged, parsed);
        }
    }

    Settings::deserialize(toml::Value::Table(merged)).with_context(|| "invalid settings")
}

impl Settings {
    /// The settings shipped with the binary, without any file layered on top.
    pub fn builtin() -> Result<Self> {
        Settings::deserialize(toml::Value::Table(builtin_table()?))
            .with_context(|| "invalid built-in settings")
    }
}

fn builtin_table() -> Result<toml::Table> {
    toml::from_str(DEFAULT_SETTINGS_TOML).with_context(|| "failed to parse built-in settings")
}

/// Later tables override earlier ones key by key; nested tables merge.
fn merge_table(base: &mut toml::Table, incoming: toml::Table) {
    for (key, value) in incoming {
        let table = match value {
            toml::Value::Table(table) => table,
            other => {
                base.insert(key, other);
                continue;
            }
        };
        if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
            merge_table(existing, table);
            continue;
        }
        base.insert(key, toml::Value::Table(table));
    }
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = home_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().and_then(|home| {
        let home = home.trim();
        if home.is_empty() {
            None
        } else {
            Some(Path::new(home).join(".pdf-layout-translator"))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_settings_carry_the_documented_defaults() {
        let settings = Settings::builtin().unwrap();
        assert_eq!(settings.translation.lang, "zh-hant");
        assert_eq!(settings.translation.formality, "academic");
        assert!(settings.formally.contains_key("academic"));
        assert_eq!(settings.classifier, ClassifierThresholds::default());
        assert_eq!(settings.render.floor_size, 3.0);
        assert_eq!(settings.validation.coverage_threshold, 0.95);
    }

    #[test]
    fn later_layers_override_single_keys() {
        let mut base = builtin_table().unwrap();
        let overlay: toml::Table =
            toml::from_str("[classifier]\nheading_size = 15.0\n[render]\nfloor_size = 4.0\n")
                .unwrap();
        merge_table(&mut base, overlay);
        let settings = Settings::deserialize(toml::Value::Table(base)).unwrap();
        assert_eq!(settings.classifier.heading_size, 15.0);
        assert_eq!(settings.classifier.sidebar_max_width, 250.0);
        assert_eq!(settings.render.floor_size, 4.0);
        assert_eq!(settings.render.body_size, 10.5);
    }

    #[test]
    fn retry_policy_follows_translation_table() {
        let settings = Settings::builtin().unwrap();
        let policy = settings.translation.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }
}
