use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const PROJECT_CONFIG_DIR: &str = ".amira";
const CONFIG_FILE: &str = "config.toml";
const DEFAULT_SYSTEM_PROMPT: &str = "You are Amira, a home automation assistant. Use the available tools to inspect and change the home configuration. Answer concisely.";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub provider_order: Vec<String>,
    pub providers: Vec<ProviderConfig>,
    pub system_prompt: String,
    pub language: String,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
    pub llm: LlmConfig,
    pub fallback: FallbackConfig,
    pub tool_loop: ToolLoopConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub memory: MemoryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let providers = default_providers();
        Self {
            provider_order: providers.iter().map(|p| p.name.clone()).collect(),
            providers,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            language: "en".to_string(),
            log_level: "info".to_string(),
            log_file: None,
            llm: LlmConfig::default(),
            fallback: FallbackConfig::default(),
            tool_loop: ToolLoopConfig::default(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Any endpoint speaking the OpenAI chat completions protocol.
    OpenAi,
    Anthropic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub base_url: String,
    pub model: String,
    pub api_key_env: Option<String>,
    pub api_key: Option<String>,
    /// USD per million input tokens.
    pub input_cost_per_mtok: Option<f64>,
    /// USD per million output tokens.
    pub output_cost_per_mtok: Option<f64>,
}

impl ProviderConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|k| !k.is_empty())
        })
    }
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "anthropic".to_string(),
            kind: ProviderKind::Anthropic,
            base_url: "https://api.anthropic.com".to_string(),
            model: "claude-3-5-haiku-latest".to_string(),
            api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
            api_key: None,
            input_cost_per_mtok: Some(0.8),
            output_cost_per_mtok: Some(4.0),
        },
        ProviderConfig {
            name: "openai".to_string(),
            kind: ProviderKind::OpenAi,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            api_key: None,
            input_cost_per_mtok: Some(0.15),
            output_cost_per_mtok: Some(0.6),
        },
    ]
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 120_000,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolLoopConfig {
    pub max_rounds: usize,
    /// Rounds after the first wait `min(3 + round, 6)` of these units.
    pub pacing_unit_ms: u64,
    pub rate_limit_wait_ms: u64,
    pub max_rate_limit_waits: usize,
    pub max_result_chars: usize,
    pub max_large_result_chars: usize,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            pacing_unit_ms: 1000,
            rate_limit_wait_ms: 10_000,
            max_rate_limit_waits: 2,
            max_result_chars: 8000,
            max_large_result_chars: 20_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub check_interval_secs: u64,
    pub tasks_file: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 60,
            tasks_file: default_tasks_file(),
        }
    }
}

/// Home Assistant add-ons see their config volume at `/config`.
fn default_tasks_file() -> PathBuf {
    let base = if Path::new("/config").is_dir() {
        PathBuf::from("/config")
    } else {
        dirs::data_dir().unwrap_or_else(|| PathBuf::from("."))
    };
    base.join("amira").join("scheduled_tasks.json")
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub semantic_enabled: bool,
    pub max_entries: usize,
    pub similarity_threshold: f64,
    pub ttl_minutes: i64,
    pub prompt_caching: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            semantic_enabled: true,
            max_entries: 100,
            similarity_threshold: 0.85,
            ttl_minutes: 30,
            prompt_caching: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    pub max_messages: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { max_messages: 40 }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FileConfig {
    pub provider_order: Option<Vec<String>>,
    pub system_prompt: Option<String>,
    pub language: Option<String>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub providers: Option<Vec<PartialProviderConfig>>,
    pub llm: Option<PartialLlmConfig>,
    pub fallback: Option<PartialFallbackConfig>,
    pub tool_loop: Option<PartialToolLoopConfig>,
    pub scheduler: Option<PartialSchedulerConfig>,
    pub cache: Option<PartialCacheConfig>,
    pub memory: Option<PartialMemoryConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialProviderConfig {
    pub name: Option<String>,
    pub kind: Option<ProviderKind>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key_env: Option<String>,
    pub api_key: Option<String>,
    pub input_cost_per_mtok: Option<f64>,
    pub output_cost_per_mtok: Option<f64>,
}

impl PartialProviderConfig {
    fn overlay(&mut self, upper: &PartialProviderConfig) {
        if upper.kind.is_some() {
            self.kind = upper.kind;
        }
        if let Some(v) = &upper.base_url {
            self.base_url = Some(v.clone());
        }
        if let Some(v) = &upper.model {
            self.model = Some(v.clone());
        }
        if let Some(v) = &upper.api_key_env {
            self.api_key_env = Some(v.clone());
        }
        if let Some(v) = &upper.api_key {
            self.api_key = Some(v.clone());
        }
        if upper.input_cost_per_mtok.is_some() {
            self.input_cost_per_mtok = upper.input_cost_per_mtok;
        }
        if upper.output_cost_per_mtok.is_some() {
            self.output_cost_per_mtok = upper.output_cost_per_mtok;
        }
    }

    fn resolve(self) -> Option<ProviderConfig> {
        let Some(name) = self.name else {
            warn!("ignoring provider entry without a name");
            return None;
        };
        let kind = self.kind.unwrap_or(ProviderKind::OpenAi);
        let base_url = self.base_url.unwrap_or_else(|| match kind {
            ProviderKind::Anthropic => "https://api.anthropic.com".to_string(),
            ProviderKind::OpenAi => "https://api.openai.com/v1".to_string(),
        });
        let Some(model) = self.model else {
            warn!(provider = %name, "ignoring provider entry without a model");
            return None;
        };
        Some(ProviderConfig {
            name,
            kind,
            base_url,
            model,
            api_key_env: self.api_key_env,
            api_key: self.api_key,
            input_cost_per_mtok: self.input_cost_per_mtok,
            output_cost_per_mtok: self.output_cost_per_mtok,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialLlmConfig {
    pub connect_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialFallbackConfig {
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialToolLoopConfig {
    pub max_rounds: Option<usize>,
    pub pacing_unit_ms: Option<u64>,
    pub rate_limit_wait_ms: Option<u64>,
    pub max_rate_limit_waits: Option<usize>,
    pub max_result_chars: Option<usize>,
    pub max_large_result_chars: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialSchedulerConfig {
    pub enabled: Option<bool>,
    pub check_interval_secs: Option<u64>,
    pub tasks_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialCacheConfig {
    pub semantic_enabled: Option<bool>,
    pub max_entries: Option<usize>,
    pub similarity_threshold: Option<f64>,
    pub ttl_minutes: Option<i64>,
    pub prompt_caching: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialMemoryConfig {
    pub max_messages: Option<usize>,
}

/// Values that outrank every file: command line first, then environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub provider_order: Option<Vec<String>>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub tasks_file: Option<PathBuf>,
    pub scheduler_enabled: Option<bool>,
}

impl Overrides {
    /// Fills the gaps left by the command line from `AMIRA_*` variables.
    pub fn with_env(mut self) -> Self {
        if self.provider_order.is_none() {
            self.provider_order = std::env::var("AMIRA_PROVIDER_ORDER")
                .ok()
                .map(|v| parse_provider_order(&v))
                .filter(|v| !v.is_empty());
        }
        if self.log_level.is_none() {
            self.log_level = std::env::var("AMIRA_LOG").ok().filter(|v| !v.is_empty());
        }
        if self.tasks_file.is_none() {
            self.tasks_file = std::env::var("AMIRA_TASKS_FILE").ok().map(PathBuf::from);
        }
        self
    }
}

pub fn parse_provider_order(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

impl AppConfig {
    pub fn from_cli(cli: &crate::Cli) -> Result<Self> {
        let project_root = std::env::current_dir().context("resolve current dir")?;

        // Load project-specific configuration first (highest priority after CLI args and env vars)
        let project_cfg = load_project_config(&project_root).unwrap_or_default();

        // Load global configuration
        let file_cfg = load_file_config().unwrap_or_default();

        let overrides = Overrides {
            provider_order: cli.providers.as_deref().map(parse_provider_order),
            log_level: cli.log_level.clone(),
            log_file: cli.log_file.clone(),
            tasks_file: cli.tasks_file.clone(),
            scheduler_enabled: cli.no_scheduler.then_some(false),
        }
        .with_env();

        Ok(Self::merge(overrides, project_cfg, file_cfg))
    }

    /// Resolves the final configuration: overrides > project file > global
    /// file > defaults.
    pub fn merge(overrides: Overrides, project_cfg: FileConfig, file_cfg: FileConfig) -> Self {
        let defaults = AppConfig::default();

        let providers = merge_providers(file_cfg.providers, project_cfg.providers)
            .unwrap_or(defaults.providers);

        let provider_order = {
            let order = overrides
                .provider_order
                .or(project_cfg.provider_order)
                .or(file_cfg.provider_order)
                .unwrap_or_else(|| providers.iter().map(|p| p.name.clone()).collect());
            let (known, unknown): (Vec<String>, Vec<String>) = order
                .into_iter()
                .partition(|name| providers.iter().any(|p| &p.name == name));
            if !unknown.is_empty() {
                warn!(?unknown, "provider_order names providers that are not configured");
            }
            known
        };

        let llm = {
            let p = project_cfg.llm.unwrap_or_default();
            let f = file_cfg.llm.unwrap_or_default();
            let d = defaults.llm;
            LlmConfig {
                connect_timeout_ms: p
                    .connect_timeout_ms
                    .or(f.connect_timeout_ms)
                    .unwrap_or(d.connect_timeout_ms),
                request_timeout_ms: p
                    .request_timeout_ms
                    .or(f.request_timeout_ms)
                    .unwrap_or(d.request_timeout_ms),
                max_tokens: p.max_tokens.or(f.max_tokens).unwrap_or(d.max_tokens),
            }
        };

        let fallback = {
            let p = project_cfg.fallback.unwrap_or_default();
            let f = file_cfg.fallback.unwrap_or_default();
            let d = defaults.fallback;
            FallbackConfig {
                max_attempts: p.max_attempts.or(f.max_attempts).unwrap_or(d.max_attempts),
                backoff_base_ms: p
                    .backoff_base_ms
                    .or(f.backoff_base_ms)
                    .unwrap_or(d.backoff_base_ms),
            }
        };

        let tool_loop = {
            let p = project_cfg.tool_loop.unwrap_or_default();
            let f = file_cfg.tool_loop.unwrap_or_default();
            let d = defaults.tool_loop;
            ToolLoopConfig {
                max_rounds: p.max_rounds.or(f.max_rounds).unwrap_or(d.max_rounds),
                pacing_unit_ms: p
                    .pacing_unit_ms
                    .or(f.pacing_unit_ms)
                    .unwrap_or(d.pacing_unit_ms),
                rate_limit_wait_ms: p
                    .rate_limit_wait_ms
                    .or(f.rate_limit_wait_ms)
                    .unwrap_or(d.rate_limit_wait_ms),
                max_rate_limit_waits: p
                    .max_rate_limit_waits
                    .or(f.max_rate_limit_waits)
                    .unwrap_or(d.max_rate_limit_waits),
                max_result_chars: p
                    .max_result_chars
                    .or(f.max_result_chars)
                    .unwrap_or(d.max_result_chars),
                max_large_result_chars: p
                    .max_large_result_chars
                    .or(f.max_large_result_chars)
                    .unwrap_or(d.max_large_result_chars),
            }
        };

        let scheduler = {
            let p = project_cfg.scheduler.unwrap_or_default();
            let f = file_cfg.scheduler.unwrap_or_default();
            let d = defaults.scheduler;
            SchedulerConfig {
                enabled: overrides
                    .scheduler_enabled
                    .or(p.enabled)
                    .or(f.enabled)
                    .unwrap_or(d.enabled),
                check_interval_secs: p
                    .check_interval_secs
                    .or(f.check_interval_secs)
                    .unwrap_or(d.check_interval_secs)
                    .max(1),
                tasks_file: overrides
                    .tasks_file
                    .or(p.tasks_file)
                    .or(f.tasks_file)
                    .unwrap_or(d.tasks_file),
            }
        };

        let cache = {
            let p = project_cfg.cache.unwrap_or_default();
            let f = file_cfg.cache.unwrap_or_default();
            let d = defaults.cache;
            CacheConfig {
                semantic_enabled: p
                    .semantic_enabled
                    .or(f.semantic_enabled)
                    .unwrap_or(d.semantic_enabled),
                max_entries: p.max_entries.or(f.max_entries).unwrap_or(d.max_entries),
                similarity_threshold: p
                    .similarity_threshold
                    .or(f.similarity_threshold)
                    .unwrap_or(d.similarity_threshold),
                ttl_minutes: p.ttl_minutes.or(f.ttl_minutes).unwrap_or(d.ttl_minutes),
                prompt_caching: p
                    .prompt_caching
                    .or(f.prompt_caching)
                    .unwrap_or(d.prompt_caching),
            }
        };

        let memory = MemoryConfig {
            max_messages: project_cfg
                .memory
                .and_then(|m| m.max_messages)
                .or(file_cfg.memory.and_then(|m| m.max_messages))
                .unwrap_or(defaults.memory.max_messages),
        };

        Self {
            provider_order,
            providers,
            system_prompt: project_cfg
                .system_prompt
                .or(file_cfg.system_prompt)
                .unwrap_or(defaults.system_prompt),
            language: project_cfg
                .language
                .or(file_cfg.language)
                .unwrap_or(defaults.language),
            log_level: overrides
                .log_level
                .or(project_cfg.log_level)
                .or(file_cfg.log_level)
                .unwrap_or(defaults.log_level),
            log_file: overrides
                .log_file
                .or(project_cfg.log_file)
                .or(file_cfg.log_file),
            llm,
            fallback,
            tool_loop,
            scheduler,
            cache,
            memory,
        }
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

/// Global providers, with project entries overriding by name and new
/// project entries appended. `None` when neither file lists providers.
fn merge_providers(
    global: Option<Vec<PartialProviderConfig>>,
    project: Option<Vec<PartialProviderConfig>>,
) -> Option<Vec<ProviderConfig>> {
    if global.is_none() && project.is_none() {
        return None;
    }
    let mut merged: Vec<PartialProviderConfig> = global.unwrap_or_default();
    for upper in project.unwrap_or_default() {
        match merged
            .iter_mut()
            .find(|p| p.name.is_some() && p.name == upper.name)
        {
            Some(existing) => existing.overlay(&upper),
            None => merged.push(upper),
        }
    }
    Some(
        merged
            .into_iter()
            .filter_map(PartialProviderConfig::resolve)
            .collect(),
    )
}

pub fn load_file_config() -> Result<FileConfig> {
    use std::env;

    fn candidate_paths() -> Vec<PathBuf> {
        let mut v = Vec::new();
        if let Ok(p) = env::var("AMIRA_CONFIG") {
            v.push(PathBuf::from(p));
        }
        if let Ok(xdg_home) = env::var("XDG_CONFIG_HOME") {
            v.push(Path::new(&xdg_home).join("amira").join(CONFIG_FILE));
        } else if let Ok(home) = env::var("HOME") {
            v.push(Path::new(&home).join(".config/amira").join(CONFIG_FILE));
        }
        v
    }

    for p in candidate_paths() {
        if p.exists() {
            let s = fs::read_to_string(&p)
                .with_context(|| format!("read config file: {}", p.display()))?;
            match toml::from_str::<FileConfig>(&s) {
                Ok(cfg) => {
                    info!(path=%p.display(), "loaded config file");
                    return Ok(cfg);
                }
                Err(e) => {
                    warn!(path=%p.display(), error=%e.to_string(), "parse config failed");
                    continue;
                }
            }
        }
    }
    Ok(FileConfig::default())
}

/// Load project-specific configuration from .amira/config.toml
pub fn load_project_config(project_root: &Path) -> Result<FileConfig> {
    let project_config_path = project_root.join(PROJECT_CONFIG_DIR).join(CONFIG_FILE);

    if project_config_path.exists() {
        let s = fs::read_to_string(&project_config_path).with_context(|| {
            format!(
                "read project config file: {}",
                project_config_path.display()
            )
        })?;
        match toml::from_str::<FileConfig>(&s) {
            Ok(cfg) => {
                info!(path=%project_config_path.display(), "loaded project config file");
                Ok(cfg)
            }
            Err(e) => {
                warn!(path=%project_config_path.display(), error=%e.to_string(), "parse project config failed");
                Ok(FileConfig::default())
            }
        }
    } else {
        Ok(FileConfig::default())
    }
}
