use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::{CrmError, Result};

pub const DEFAULT_USER_AGENT: &str = "crm/0.2";
pub const DEFAULT_CONFIG_PATH: &str = ".crm/config.toml";
pub const ENV_FILE_NAME: &str = ".env";
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PHOTO_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_HTTP_RETRIES: usize = 2;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// On-disk shape of `.crm/config.toml`. Every key is optional.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfigFile {
    #[serde(default)]
    pub supabase: SupabaseSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub contacts: ContactsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SupabaseSection {
    pub url: Option<String>,
    pub anon_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub timeout_ms: Option<u64>,
    pub photo_timeout_ms: Option<u64>,
    pub retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ContactsSection {
    pub page_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub timeout_ms: u64,
    pub photo_timeout_ms: u64,
    pub retries: usize,
    pub retry_delay_ms: u64,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            photo_timeout_ms: DEFAULT_PHOTO_TIMEOUT_MS,
            retries: DEFAULT_HTTP_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/// Resolved settings handed to every component constructor.
///
/// Credentials stay optional here so that a page can still render its
/// degraded state; [`CrmConfig::credentials`] is the point where their
/// absence becomes an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrmConfig {
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
    pub http: HttpSettings,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupabaseCredentials {
    pub url: String,
    pub anon_key: String,
}

impl Default for CrmConfig {
    fn default() -> Self {
        Self {
            supabase_url: None,
            supabase_anon_key: None,
            http: HttpSettings::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl CrmConfig {
    /// Read the config file (if any) and apply process env on top.
    pub fn load(config_path: &Path) -> Result<Self> {
        let file = load_config_file(config_path)?;
        Ok(Self::resolve(&file))
    }

    /// Resolve settings: env > config file > defaults.
    pub fn resolve(file: &ConfigFile) -> Self {
        Self::resolve_with_lookup(file, |key| env::var(key).ok())
    }

    pub fn resolve_with_lookup<F>(file: &ConfigFile, lookup_env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_text = |key: &str| {
            lookup_env(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let env_u64 = |key: &str| env_text(key).and_then(|value| value.parse::<u64>().ok());
        let env_usize = |key: &str| env_text(key).and_then(|value| value.parse::<usize>().ok());

        let supabase_url = env_text("SUPABASE_URL").or_else(|| non_blank(&file.supabase.url));
        let supabase_anon_key = env_text("SUPABASE_ANON_KEY")
            .or_else(|| env_text("SUPABASE_KEY"))
            .or_else(|| non_blank(&file.supabase.anon_key));

        let defaults = HttpSettings::default();
        let http = HttpSettings {
            timeout_ms: env_u64("CRM_HTTP_TIMEOUT_MS")
                .or(file.http.timeout_ms)
                .unwrap_or(defaults.timeout_ms),
            photo_timeout_ms: env_u64("CRM_PHOTO_TIMEOUT_MS")
                .or(file.http.photo_timeout_ms)
                .unwrap_or(defaults.photo_timeout_ms),
            retries: env_usize("CRM_HTTP_RETRIES")
                .or(file.http.retries)
                .unwrap_or(defaults.retries),
            retry_delay_ms: env_u64("CRM_HTTP_RETRY_DELAY_MS")
                .or(file.http.retry_delay_ms)
                .unwrap_or(defaults.retry_delay_ms),
            user_agent: env_text("CRM_USER_AGENT")
                .or_else(|| non_blank(&file.http.user_agent))
                .unwrap_or(defaults.user_agent),
        };

        let page_size = env_usize("CRM_PAGE_SIZE")
            .or(file.contacts.page_size)
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .max(1);

        Self {
            supabase_url,
            supabase_anon_key,
            http,
            page_size,
        }
    }

    pub fn credentials(&self) -> Result<SupabaseCredentials> {
        let url = self.supabase_url.clone().ok_or_else(|| {
            CrmError::ConfigurationMissing("SUPABASE_URL is not set".to_string())
        })?;
        let anon_key = self.supabase_anon_key.clone().ok_or_else(|| {
            CrmError::ConfigurationMissing("SUPABASE_ANON_KEY is not set".to_string())
        })?;
        Ok(SupabaseCredentials {
            url: url.trim_end_matches('/').to_string(),
            anon_key,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.supabase_url.is_some() && self.supabase_anon_key.is_some()
    }
}

/// Parse `.crm/config.toml`. A missing file yields the default config.
pub fn load_config_file(config_path: &Path) -> Result<ConfigFile> {
    if !config_path.exists() {
        return Ok(ConfigFile::default());
    }
    let content = fs::read_to_string(config_path).map_err(|error| {
        CrmError::Config(format!("failed to read {}: {error}", config_path.display()))
    })?;
    toml::from_str(&content).map_err(|error| {
        CrmError::Config(format!("failed to parse {}: {error}", config_path.display()))
    })
}

#[derive(Debug, Clone, Default)]
pub struct SupabaseConfigPatch {
    pub set_url: Option<String>,
    pub set_anon_key: Option<String>,
}

/// Update keys under `[supabase]` while preserving every other section.
/// Returns `true` when a write occurred.
pub fn patch_supabase_config(config_path: &Path, patch: &SupabaseConfigPatch) -> Result<bool> {
    if patch.set_url.is_none() && patch.set_anon_key.is_none() {
        return Ok(false);
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path).map_err(|error| {
            CrmError::Config(format!("failed to read {}: {error}", config_path.display()))
        })?;
        toml::from_str::<Value>(&content).map_err(|error| {
            CrmError::Config(format!("failed to parse {}: {error}", config_path.display()))
        })?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        CrmError::Config(format!(
            "top-level TOML must be a table in {}",
            config_path.display()
        ))
    })?;
    let section = root_table
        .entry("supabase".to_string())
        .or_insert_with(|| Value::Table(Default::default()))
        .as_table_mut()
        .ok_or_else(|| {
            CrmError::Config(format!(
                "[supabase] must be a table in {}",
                config_path.display()
            ))
        })?;

    if let Some(url) = &patch.set_url {
        let url = url.trim();
        if url.is_empty() {
            return Err(CrmError::Validation("supabase url cannot be empty".to_string()));
        }
        section.insert("url".to_string(), Value::String(url.to_string()));
    }
    if let Some(key) = &patch.set_anon_key {
        let key = key.trim();
        if key.is_empty() {
            return Err(CrmError::Validation(
                "supabase anon key cannot be empty".to_string(),
            ));
        }
        section.insert("anon_key".to_string(), Value::String(key.to_string()));
    }

    if root == original {
        return Ok(false);
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            CrmError::Config(format!("failed to create {}: {error}", parent.display()))
        })?;
    }
    let rendered = toml::to_string_pretty(&root)
        .map_err(|error| CrmError::Config(format!("failed to serialize config: {error}")))?;
    fs::write(config_path, rendered).map_err(|error| {
        CrmError::Config(format!("failed to write {}: {error}", config_path.display()))
    })?;
    Ok(true)
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
