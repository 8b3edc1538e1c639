use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};
use std::time::Duration;

use crate::category::Category;
use crate::render::{DEFAULT_BITMAP_CACHE_CAPACITY, DEFAULT_MAX_PIXELS};
use crate::sync::{BackgroundPolicy, DEFAULT_MIN_FETCH_INTERVAL, DEFAULT_PROBE};

pub const CURRENT_VERSION: u32 = 2;
const SETTINGS_FILENAME: &str = "config.yaml";
pub const APP_NAME: &str = "timetable-sync";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Root of the per-category document directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// URL of a JSON object mapping config keys to document URLs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_endpoint: Option<String>,

    #[serde(default = "default_min_fetch_interval_secs")]
    pub min_fetch_interval_secs: u64,

    /// Config key to document URL, used when no endpoint is set and as
    /// fallback values otherwise
    #[serde(default)]
    pub documents: BTreeMap<String, String>,

    #[serde(default)]
    pub selected_category: Category,

    #[serde(default)]
    pub dark_mode: bool,

    #[serde(default)]
    pub background_transfers: BackgroundPolicy,

    #[serde(default = "default_max_bitmap_pixels")]
    pub max_bitmap_pixels: u64,

    #[serde(default = "default_bitmap_cache_capacity")]
    pub bitmap_cache_capacity: usize,

    #[serde(default = "default_reachability_probe")]
    pub reachability_probe: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Removed in v2: a single URL shown for both categories
    #[serde(default, skip_serializing)]
    pub document_url: Option<String>,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_min_fetch_interval_secs() -> u64 {
    DEFAULT_MIN_FETCH_INTERVAL.as_secs()
}

fn default_max_bitmap_pixels() -> u64 {
    DEFAULT_MAX_PIXELS
}

fn default_bitmap_cache_capacity() -> usize {
    DEFAULT_BITMAP_CACHE_CAPACITY
}

fn default_reachability_probe() -> String {
    DEFAULT_PROBE.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            cache_dir: None,
            config_endpoint: None,
            min_fetch_interval_secs: default_min_fetch_interval_secs(),
            documents: BTreeMap::new(),
            selected_category: Category::default(),
            dark_mode: false,
            background_transfers: BackgroundPolicy::default(),
            max_bitmap_pixels: default_max_bitmap_pixels(),
            bitmap_cache_capacity: default_bitmap_cache_capacity(),
            reachability_probe: default_reachability_probe(),
            log_level: default_log_level(),
            document_url: None,
        }
    }
}

static SETTINGS: LazyLock<RwLock<Settings>> = LazyLock::new(|| RwLock::new(Settings::default()));

/// Settings file chosen with `load_settings_from`, if any
static ACTIVE_PATH: LazyLock<RwLock<Option<PathBuf>>> = LazyLock::new(|| RwLock::new(None));

fn preferred_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

fn active_config_path() -> Option<PathBuf> {
    ACTIVE_PATH
        .read()
        .ok()
        .and_then(|path| path.clone())
        .or_else(preferred_config_path)
}

pub fn load_settings() {
    let Some(path) = preferred_config_path() else {
        warn!("Could not determine config directory, using default settings");
        return;
    };
    load_settings_from(&path);
}

/// Load settings from `path`, creating it with defaults when missing.
/// Later saves go to the same file.
pub fn load_settings_from(path: &Path) {
    if let Ok(mut active) = ACTIVE_PATH.write() {
        *active = Some(path.to_path_buf());
    }

    if path.exists() {
        load_settings_from_path(path);
    } else {
        info!("Settings file not found, creating with defaults at {path:?}");
        if let Ok(settings) = SETTINGS.read() {
            save_settings_to_file(&settings, path);
        }
    }
}

fn load_settings_from_path(path: &Path) {
    match fs::read_to_string(path) {
        Ok(content) => match serde_yaml::from_str::<Settings>(&content) {
            Ok(mut settings) => {
                debug!("Loaded settings from {path:?}");

                if settings.version < CURRENT_VERSION {
                    migrate_settings(&mut settings);
                    save_settings_to_file(&settings, path);
                }

                if let Ok(mut global) = SETTINGS.write() {
                    *global = settings;
                }
            }
            Err(e) => {
                error!("Failed to parse settings file {path:?}: {e}");
            }
        },
        Err(e) => {
            error!("Failed to read settings file {path:?}: {e}");
        }
    }
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );

    if settings.version < 2 {
        migrate_v1_to_v2(settings);
    }

    settings.version = CURRENT_VERSION;
}

/// v1 had one `document_url` for everything; v2 keys URLs per category.
fn migrate_v1_to_v2(settings: &mut Settings) {
    if let Some(url) = settings.document_url.take() {
        for category in Category::ALL {
            settings
                .documents
                .entry(category.config_key().to_string())
                .or_insert_with(|| url.clone());
        }
    }
}

pub fn save_settings() {
    let Some(path) = active_config_path() else {
        warn!("Could not determine config directory, cannot save settings");
        return;
    };

    if let Ok(settings) = SETTINGS.read() {
        save_settings_to_file(&settings, &path);
    }
}

fn save_settings_to_file(settings: &Settings, path: &Path) {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            if let Err(e) = fs::create_dir_all(parent) {
                error!("Failed to create config directory {parent:?}: {e}");
                return;
            }
        }
    }

    let content = generate_settings_yaml(settings);

    match fs::write(path, content) {
        Ok(()) => debug!("Saved settings to {path:?}"),
        Err(e) => error!("Failed to save settings to {path:?}: {e}"),
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn generate_settings_yaml(settings: &Settings) -> String {
    let mut content = String::new();

    content.push_str(&format!("version: {}\n", settings.version));
    content.push('\n');

    content.push_str(DOCUMENTS_TEMPLATE);
    if let Some(endpoint) = &settings.config_endpoint {
        content.push_str(&format!("config_endpoint: {}\n", quote(endpoint)));
    }
    content.push_str(&format!(
        "min_fetch_interval_secs: {}\n",
        settings.min_fetch_interval_secs
    ));
    if settings.documents.is_empty() {
        content.push_str("documents: {}\n");
    } else {
        content.push_str("documents:\n");
        for (key, url) in &settings.documents {
            content.push_str(&format!("  {key}: {}\n", quote(url)));
        }
    }
    content.push('\n');

    if let Some(cache_dir) = &settings.cache_dir {
        content.push_str(&format!(
            "cache_dir: {}\n",
            quote(&cache_dir.to_string_lossy())
        ));
    }
    content.push_str(&format!(
        "selected_category: {}\n",
        settings.selected_category.as_str()
    ));
    content.push_str(&format!("dark_mode: {}\n", settings.dark_mode));
    let policy = match settings.background_transfers {
        BackgroundPolicy::Complete => "complete",
        BackgroundPolicy::Abort => "abort",
    };
    content.push_str(&format!("background_transfers: {policy}\n"));
    content.push_str(&format!(
        "max_bitmap_pixels: {}\n",
        settings.max_bitmap_pixels
    ));
    content.push_str(&format!(
        "bitmap_cache_capacity: {}\n",
        settings.bitmap_cache_capacity
    ));
    content.push_str(&format!(
        "reachability_probe: {}\n",
        quote(&settings.reachability_probe)
    ));
    content.push_str(&format!("log_level: {}\n", settings.log_level));

    content
}

const DOCUMENTS_TEMPLATE: &str = r#"# ============================================================================
# Documents
# ============================================================================
# Where the timetables come from. With `config_endpoint` set, the URLs are
# read from that JSON object (at most once per `min_fetch_interval_secs`);
# `documents` supplies the values otherwise.
#
# Example:
#   config_endpoint: "https://example.org/timetable-config.json"
#   documents:
#     url_high_school: "https://example.org/plans/high.pdf"
#     url_middle_school: "https://example.org/plans/middle.pdf"

"#;

// Public API for accessing/modifying settings

pub fn get_settings() -> Settings {
    SETTINGS.read().map(|s| s.clone()).unwrap_or_default()
}

/// Configured cache root, or the platform cache directory.
pub fn get_cache_dir() -> Option<PathBuf> {
    SETTINGS
        .read()
        .ok()
        .and_then(|s| s.cache_dir.clone())
        .or_else(|| dirs::cache_dir().map(|dir| dir.join(APP_NAME)))
}

pub fn get_config_endpoint() -> Option<String> {
    SETTINGS
        .read()
        .ok()
        .and_then(|s| s.config_endpoint.clone())
        .filter(|endpoint| !endpoint.trim().is_empty())
}

pub fn get_min_fetch_interval() -> Duration {
    SETTINGS
        .read()
        .map(|s| Duration::from_secs(s.min_fetch_interval_secs))
        .unwrap_or(DEFAULT_MIN_FETCH_INTERVAL)
}

pub fn get_documents() -> BTreeMap<String, String> {
    SETTINGS
        .read()
        .map(|s| s.documents.clone())
        .unwrap_or_default()
}

pub fn get_selected_category() -> Category {
    SETTINGS
        .read()
        .map(|s| s.selected_category)
        .unwrap_or_default()
}

pub fn set_selected_category(category: Category) {
    if let Ok(mut settings) = SETTINGS.write() {
        settings.selected_category = category;
    }
    save_settings();
}

pub fn is_dark_mode() -> bool {
    SETTINGS.read().map(|s| s.dark_mode).unwrap_or(false)
}

pub fn set_dark_mode(enabled: bool) {
    if let Ok(mut settings) = SETTINGS.write() {
        settings.dark_mode = enabled;
    }
    save_settings();
}

pub fn get_background_policy() -> BackgroundPolicy {
    SETTINGS
        .read()
        .map(|s| s.background_transfers)
        .unwrap_or_default()
}

pub fn get_max_bitmap_pixels() -> u64 {
    SETTINGS
        .read()
        .map(|s| s.max_bitmap_pixels)
        .unwrap_or(DEFAULT_MAX_PIXELS)
}

pub fn get_bitmap_cache_capacity() -> usize {
    SETTINGS
        .read()
        .map(|s| s.bitmap_cache_capacity)
        .unwrap_or(DEFAULT_BITMAP_CACHE_CAPACITY)
}

pub fn get_reachability_probe() -> String {
    SETTINGS
        .read()
        .map(|s| s.reachability_probe.clone())
        .unwrap_or_else(|_| default_reachability_probe())
}

pub fn get_log_level() -> log::LevelFilter {
    let level = SETTINGS
        .read()
        .map(|s| s.log_level.clone())
        .unwrap_or_else(|_| default_log_level());
    level.parse().unwrap_or(log::LevelFilter::Info)
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use tempfile::TempDir;

    use super::*;

    fn reset() {
        if let Ok(mut settings) = SETTINGS.write() {
            *settings = Settings::default();
        }
    }

    #[test]
    fn generated_yaml_parses_back() {
        let mut settings = Settings {
            config_endpoint: Some("https://example.org/config.json".into()),
            cache_dir: Some(PathBuf::from("/var/cache/plans")),
            selected_category: Category::Secondary,
            dark_mode: true,
            background_transfers: BackgroundPolicy::Abort,
            log_level: "debug".into(),
            ..Settings::default()
        };
        settings.documents.insert(
            "url_high_school".into(),
            "https://example.org/a \"quoted\".pdf".into(),
        );

        let parsed: Settings = serde_yaml::from_str(&generate_settings_yaml(&settings)).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn missing_keys_take_defaults() {
        let parsed: Settings = serde_yaml::from_str("dark_mode: true\n").unwrap();
        assert!(parsed.dark_mode);
        assert_eq!(parsed.version, CURRENT_VERSION);
        assert_eq!(parsed.max_bitmap_pixels, DEFAULT_MAX_PIXELS);
        assert_eq!(parsed.selected_category, Category::Primary);
        assert_eq!(parsed.background_transfers, BackgroundPolicy::Complete);
    }

    #[test]
    fn v1_document_url_is_split_per_category() {
        let mut settings: Settings =
            serde_yaml::from_str("version: 1\ndocument_url: \"https://example.org/p.pdf\"\n").unwrap();
        migrate_settings(&mut settings);

        assert_eq!(settings.version, CURRENT_VERSION);
        assert!(settings.document_url.is_none());
        for category in Category::ALL {
            assert_eq!(
                settings.documents.get(category.config_key()).map(String::as_str),
                Some("https://example.org/p.pdf")
            );
        }
    }

    #[test]
    #[serial]
    fn load_creates_file_and_setters_persist() {
        reset();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join(SETTINGS_FILENAME);

        load_settings_from(&path);
        assert!(path.exists());

        set_selected_category(Category::Secondary);
        set_dark_mode(true);

        reset();
        load_settings_from(&path);
        assert_eq!(get_selected_category(), Category::Secondary);
        assert!(is_dark_mode());
        reset();
    }

    #[test]
    #[serial]
    fn old_file_is_migrated_on_load() {
        reset();
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(SETTINGS_FILENAME);
        fs::write(&path, "version: 1\ndocument_url: \"https://example.org/p.pdf\"\n").unwrap();

        load_settings_from(&path);
        assert_eq!(
            get_documents().get("url_middle_school").map(String::as_str),
            Some("https://example.org/p.pdf")
        );
        let rewritten = fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains(&format!("version: {CURRENT_VERSION}")));
        assert!(!rewritten.contains("document_url"));
        reset();
    }

    #[test]
    #[serial]
    fn log_level_falls_back_to_info() {
        reset();
        if let Ok(mut settings) = SETTINGS.write() {
            settings.log_level = "chatty".into();
        }
        assert_eq!(get_log_level(), log::LevelFilter::Info);
        reset();
    }
}
