// Configuration management for persistent state

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::StoredConnection;
use crate::state::settings::AppSettings;

#[cfg(debug_assertions)]
const APP_NAME: &str = "mango-admin-dev";

#[cfg(not(debug_assertions))]
const APP_NAME: &str = "mango-admin";

pub const CONFIG_DIR_ENV: &str = "MANGO_ADMIN_CONFIG_DIR";

/// Manages persistent configuration files
#[derive(Clone, Debug)]
pub struct ConfigManager {
    config_dir: PathBuf,
}

impl ConfigManager {
    /// Create a new ConfigManager, initializing the config directory if needed
    pub fn new() -> Result<Self> {
        Self::with_config_dir(Self::get_config_dir()?)
    }

    pub fn with_config_dir(config_dir: PathBuf) -> Result<Self> {
        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        }
        Ok(Self { config_dir })
    }

    /// Platform config directory, unless overridden through the environment
    fn get_config_dir() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
            return Ok(PathBuf::from(dir));
        }
        dirs::config_dir().map(|p| p.join(APP_NAME)).context("Could not determine config directory")
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    fn file_path(&self, filename: &str) -> PathBuf {
        self.config_dir.join(filename)
    }

    fn load_json<T: DeserializeOwned>(&self, filename: &str) -> Result<Option<T>> {
        load_json_file(&self.file_path(filename))
    }

    fn save_json<T: Serialize + ?Sized>(&self, filename: &str, data: &T) -> Result<()> {
        save_json_file(&self.file_path(filename), data)
    }

    // =========================================================================
    // Settings
    // =========================================================================

    const SETTINGS_FILE: &'static str = "settings.json";
    const CONNECTIONS_FILE: &'static str = "connections.json";

    /// Load application settings, falling back to defaults when none are saved
    pub fn load_settings(&self) -> Result<AppSettings> {
        Ok(self.load_json(Self::SETTINGS_FILE)?.unwrap_or_default())
    }

    pub fn save_settings(&self, settings: &AppSettings) -> Result<()> {
        self.save_json(Self::SETTINGS_FILE, settings)
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Open the file-backed connection store
    pub fn connection_store(&self) -> Result<JsonConnectionStore> {
        JsonConnectionStore::open(self.file_path(Self::CONNECTIONS_FILE))
    }
}

/// Persistent `name -> {connection_string, connection_options, ssh_options}` map.
///
/// Mutations are in-memory until `save` is called.
pub trait ConnectionStore: Send {
    fn get(&self, name: &str) -> Option<StoredConnection>;
    fn set(&mut self, name: &str, value: StoredConnection);
    fn remove(&mut self, name: &str) -> Option<StoredConnection>;
    fn names(&self) -> Vec<String>;
    fn save(&self) -> Result<()>;

    fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConnectionsFile {
    #[serde(default)]
    connections: BTreeMap<String, StoredConnection>,
}

/// `connections.json` in the config directory
#[derive(Debug)]
pub struct JsonConnectionStore {
    path: PathBuf,
    file: ConnectionsFile,
}

impl JsonConnectionStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = load_json_file(&path)?.unwrap_or_default();
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionStore for JsonConnectionStore {
    fn get(&self, name: &str) -> Option<StoredConnection> {
        self.file.connections.get(name).cloned()
    }

    fn set(&mut self, name: &str, value: StoredConnection) {
        self.file.connections.insert(name.to_string(), value);
    }

    fn remove(&mut self, name: &str) -> Option<StoredConnection> {
        self.file.connections.remove(name)
    }

    fn names(&self) -> Vec<String> {
        self.file.connections.keys().cloned().collect()
    }

    fn save(&self) -> Result<()> {
        save_json_file(&self.path, &self.file)
    }
}

fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let data =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let value: T = serde_json::from_str(&data)
        .with_context(|| format!("Failed to deserialize {}", path.display()))?;

    Ok(Some(value))
}

fn save_json_file<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .with_context(|| format!("Failed to serialize {}", path.display()))?;

    atomic_write(path, json.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;

    Ok(())
}

/// Write to a sibling temp file, then rename over `path`.
fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(path);
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
