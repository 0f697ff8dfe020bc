//! Configuration loading, environment overrides, and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level Animo configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub render: Option<RenderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<ModelsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Public base URL used when building artifact links.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: None,
            port: default_port(),
            base_url: None,
        }
    }
}

/// How the external renderer is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Renderer executable (default: `manim`).
    #[serde(default = "default_render_command")]
    pub command: String,

    /// Working directory for the renderer process.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,

    /// Directory holding per-job scratch directories (default: system temp).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<String>,

    #[serde(default = "default_video_format")]
    pub video_format: String,

    /// Quality flag passed for preview renders.
    #[serde(default = "default_preview_quality_flag")]
    pub preview_quality_flag: String,

    /// Keep every Nth frame of a preview render.
    #[serde(default = "default_preview_frame_stride")]
    pub preview_frame_stride: usize,

    /// Divide preview frame width and height by this factor.
    #[serde(default = "default_preview_downscale")]
    pub preview_downscale: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Stderr lines retained for failure reports.
    #[serde(default = "default_max_stderr_lines")]
    pub max_stderr_lines: usize,
}

fn default_render_command() -> String {
    "manim".into()
}

fn default_video_format() -> String {
    "mp4".into()
}

fn default_preview_quality_flag() -> String {
    "-ql".into()
}

fn default_preview_frame_stride() -> usize {
    4
}

fn default_preview_downscale() -> u32 {
    4
}

fn default_max_stderr_lines() -> usize {
    2000
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            command: default_render_command(),
            work_dir: None,
            scratch_dir: None,
            video_format: default_video_format(),
            preview_quality_flag: default_preview_quality_flag(),
            preview_frame_stride: default_preview_frame_stride(),
            preview_downscale: default_preview_downscale(),
            timeout_secs: None,
            max_stderr_lines: default_max_stderr_lines(),
        }
    }
}

impl RenderConfig {
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .as_ref()
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
            .unwrap_or_else(|| std::env::temp_dir().join("animo"))
    }

    pub fn work_dir(&self) -> Option<PathBuf> {
        self.work_dir
            .as_ref()
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Local,
    Azure,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Directory served under `/public` (default: `public`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_dir: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureStorageConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AzureStorageConfig {
    /// e.g. `https://account.blob.core.windows.net/videos`
    pub container_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sas_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sas_token_env: Option<String>,
}

impl AzureStorageConfig {
    pub fn resolve_sas_token(&self) -> Option<String> {
        resolve_secret_field(&self.sas_token, &self.sas_token_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderConfig>>,
}

/// Configuration for a single LLM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl ProviderConfig {
    /// Entry for a known provider id with its conventional key variable.
    pub fn from_env_defaults(id: &str) -> Self {
        Self {
            id: id.to_string(),
            api_key_env: default_api_key_env(id).map(str::to_string),
            api_key: None,
            base_url: None,
            default_model: None,
        }
    }

    /// Resolve the API key: `api_key`, then `api_key_env`, then the provider's
    /// conventional variable (`OPENAI_API_KEY`, `ANTHROPIC_API_KEY`).
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env).or_else(|| {
            let fallback = default_api_key_env(&self.id).map(str::to_string);
            resolve_secret_field(&None, &fallback)
        })
    }
}

fn default_api_key_env(id: &str) -> Option<&'static str> {
    match id {
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" => Some("ANTHROPIC_API_KEY"),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Hard cap on preview tool calls per chat request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tool_iterations: Option<u32>,

    /// Retries of one provider turn after transient errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "animo_render=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    static ENV_REF: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"\$\{([^}]+)\}").expect("env reference pattern is valid")
    });
    ENV_REF
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::AnimoError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Apply the service's environment overrides (`PORT`, `BASE_URL`,
    /// `USE_LOCAL_STORAGE`, `AZURE_STORAGE_CONTAINER_URL`, `AZURE_STORAGE_SAS_TOKEN`).
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
    }

    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup("PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.server.get_or_insert_with(ServerConfig::default).port = port;
        }
        if let Some(base_url) = lookup("BASE_URL") {
            self.server.get_or_insert_with(ServerConfig::default).base_url = Some(base_url);
        }
        if let Some(flag) = lookup("USE_LOCAL_STORAGE") {
            let storage = self.storage.get_or_insert_with(StorageConfig::default);
            storage.backend = if flag == "true" {
                StorageBackend::Local
            } else {
                StorageBackend::Azure
            };
        }
        if let Some(url) = lookup("AZURE_STORAGE_CONTAINER_URL") {
            let storage = self.storage.get_or_insert_with(StorageConfig::default);
            storage
                .azure
                .get_or_insert_with(AzureStorageConfig::default)
                .container_url = url;
        }
        if let Some(token) = lookup("AZURE_STORAGE_SAS_TOKEN") {
            let storage = self.storage.get_or_insert_with(StorageConfig::default);
            storage
                .azure
                .get_or_insert_with(AzureStorageConfig::default)
                .sas_token = Some(token);
        }
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn bind_addr(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn port(&self) -> u16 {
        self.server
            .as_ref()
            .map(|s| s.port)
            .unwrap_or_else(default_port)
    }

    pub fn base_url(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.base_url.clone())
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string())
    }

    pub fn render_config(&self) -> RenderConfig {
        self.render.clone().unwrap_or_default()
    }

    pub fn storage_backend(&self) -> StorageBackend {
        self.storage.as_ref().map(|s| s.backend).unwrap_or_default()
    }

    pub fn public_dir(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.public_dir.as_ref())
            .map(|d| PathBuf::from(shellexpand::tilde(d).as_ref()))
            .unwrap_or_else(|| PathBuf::from("public"))
    }

    pub fn azure_storage(&self) -> Option<&AzureStorageConfig> {
        self.storage.as_ref().and_then(|s| s.azure.as_ref())
    }

    /// Configured providers, or `openai` + `anthropic` keyed from the environment.
    pub fn providers(&self) -> Vec<ProviderConfig> {
        self.models
            .as_ref()
            .and_then(|m| m.providers.clone())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| {
                vec![
                    ProviderConfig::from_env_defaults("openai"),
                    ProviderConfig::from_env_defaults("anthropic"),
                ]
            })
    }

    pub fn max_tokens(&self) -> u32 {
        self.agent
            .as_ref()
            .and_then(|a| a.max_tokens)
            .unwrap_or(4096)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.agent.as_ref().and_then(|a| a.temperature)
    }

    pub fn max_tool_iterations(&self) -> u32 {
        self.agent
            .as_ref()
            .and_then(|a| a.max_tool_iterations)
            .unwrap_or(5)
    }

    pub fn max_retries(&self) -> u32 {
        self.agent
            .as_ref()
            .and_then(|a| a.max_retries)
            .unwrap_or(3)
    }

    pub fn retry_backoff_ms(&self) -> u64 {
        self.agent
            .as_ref()
            .and_then(|a| a.retry_backoff_ms)
            .unwrap_or(1000)
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        for p in self.providers() {
            if p.resolve_api_key().is_none() {
                warnings.push(format!("Provider '{}' has no API key configured", p.id));
            }
        }

        if self.storage_backend() == StorageBackend::Azure {
            match self.azure_storage() {
                Some(azure) if !azure.container_url.is_empty() => {
                    if azure.resolve_sas_token().is_none() {
                        warnings.push("Azure storage has no SAS token configured".to_string());
                    }
                }
                _ => errors.push(
                    "Azure storage backend selected but storage.azure.container_url is missing"
                        .to_string(),
                ),
            }
        }

        if let Some(server) = &self.server {
            if server.port == 0 {
                errors.push("Server port cannot be 0".to_string());
            }
        }

        let render = self.render_config();
        if render.preview_frame_stride == 0 {
            errors.push("render.preview_frame_stride must be at least 1".to_string());
        }
        if render.preview_downscale == 0 {
            errors.push("render.preview_downscale must be at least 1".to_string());
        }

        (warnings, errors)
    }
}

/// Base directory for Animo data: `~/.animo/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".animo")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_ANIMO_KEY", "sk-test-123") };
        let input = r#"{"key": "${TEST_ANIMO_KEY}", "other": "plain"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("sk-test-123"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_ANIMO_KEY") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_ANIMO_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port(), 8080);
        assert_eq!(config.base_url(), "http://127.0.0.1:8080");
        assert_eq!(config.max_tool_iterations(), 5);
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.storage_backend(), StorageBackend::Local);
        let render = config.render_config();
        assert_eq!(render.command, "manim");
        assert_eq!(render.preview_frame_stride, 4);
        assert_eq!(render.preview_downscale, 4);
    }

    #[test]
    fn test_render_section_partial_uses_defaults() {
        let config: Config =
            json5::from_str(r#"{ render: { command: "/opt/manim", timeout_secs: 60 } }"#).unwrap();
        let render = config.render_config();
        assert_eq!(render.command, "/opt/manim");
        assert_eq!(render.timeout_secs, Some(60));
        assert_eq!(render.video_format, "mp4");
        assert_eq!(render.max_stderr_lines, 2000);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.json")).unwrap();
        assert!(config.server.is_none());
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are allowed
                server: { port: 9000, base_url: "https://animo.example" },
                storage: { backend: "azure", azure: { container_url: "https://a.blob/videos" } },
            }"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.port(), 9000);
        assert_eq!(config.base_url(), "https://animo.example");
        assert_eq!(config.storage_backend(), StorageBackend::Azure);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PORT", "9123"),
            ("BASE_URL", "https://cdn.example"),
            ("USE_LOCAL_STORAGE", "false"),
            ("AZURE_STORAGE_CONTAINER_URL", "https://acct.blob.core.windows.net/v"),
            ("AZURE_STORAGE_SAS_TOKEN", "sv=1&sig=abc"),
        ]);
        let mut config = Config::default();
        config.apply_overrides_from(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.port(), 9123);
        assert_eq!(config.base_url(), "https://cdn.example");
        assert_eq!(config.storage_backend(), StorageBackend::Azure);
        let azure = config.azure_storage().unwrap();
        assert_eq!(azure.container_url, "https://acct.blob.core.windows.net/v");
        assert_eq!(azure.resolve_sas_token().as_deref(), Some("sv=1&sig=abc"));
    }

    #[test]
    fn test_use_local_storage_true_keeps_local() {
        let mut config = Config::default();
        config.apply_overrides_from(|k| (k == "USE_LOCAL_STORAGE").then(|| "true".to_string()));
        assert_eq!(config.storage_backend(), StorageBackend::Local);
    }

    #[test]
    fn test_provider_resolve_api_key() {
        // SAFETY: test-only, single-threaded test runner
        unsafe { std::env::set_var("TEST_ANIMO_API_KEY", "from-env") };
        let provider = ProviderConfig {
            id: "custom".into(),
            api_key_env: Some("TEST_ANIMO_API_KEY".into()),
            api_key: None,
            base_url: None,
            default_model: None,
        };
        assert_eq!(provider.resolve_api_key(), Some("from-env".into()));

        let provider2 = ProviderConfig {
            api_key: Some("direct-key".into()),
            ..provider
        };
        assert_eq!(provider2.resolve_api_key(), Some("direct-key".into()));
        unsafe { std::env::remove_var("TEST_ANIMO_API_KEY") };
    }

    #[test]
    fn test_default_providers() {
        let providers = Config::default().providers();
        let ids: Vec<&str> = providers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["openai", "anthropic"]);
        assert_eq!(providers[0].api_key_env.as_deref(), Some("OPENAI_API_KEY"));
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_logging_config_filters() {
        let json_str = r#"{
            "logging": {
                "format": "json",
                "filters": ["animo_render=debug", "animo_agent=trace"]
            }
        }"#;
        let config: Config = json5::from_str(json_str).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "json");
        assert_eq!(logging.filters, vec!["animo_render=debug", "animo_agent=trace"]);
    }

    #[test]
    fn test_validate_azure_without_container_errors() {
        let config = Config {
            storage: Some(StorageConfig {
                backend: StorageBackend::Azure,
                public_dir: None,
                azure: None,
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(
            errors.iter().any(|e| e.contains("container_url")),
            "Expected an error about the container url, got: {errors:?}"
        );
    }

    #[test]
    fn test_validate_zero_stride_errors() {
        let config = Config {
            render: Some(RenderConfig {
                preview_frame_stride: 0,
                ..RenderConfig::default()
            }),
            ..Config::default()
        };
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("preview_frame_stride")));
    }
}
