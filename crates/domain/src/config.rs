use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config — the single `settings` file the daemon loads at
// startup (TOML on disk, overridable per-field via env in main.rs).
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Bearer token required on protected routes. Unset = dev mode, no auth.
    #[serde(default)]
    pub api_token_env: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: d_port(), host: d_host(), cors: CorsConfig::default(), api_token_env: None, rate_limit: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { allowed_origins: d_cors_origins() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub burst_size: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Data directory layout
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root data directory. Sessions, automations, and mount plans all
    /// live under here unless individually overridden.
    #[serde(default = "d_data_root")]
    pub root: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self { root: d_data_root() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider system
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    #[serde(default = "d_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "d_2")]
    pub max_retries: u32,
    /// Registered providers, in priority order — the first that mounts
    /// successfully and satisfies a request's required capabilities wins.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub default_model: Option<String>,
    /// Selection priority — lower fires first; ties break on declaration
    /// order. Orchestrator provider selection (spec.md §4.5 step 4).
    #[serde(default = "d_100")]
    pub priority: i32,
}

fn d_100() -> i32 {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiCompat,
    Anthropic,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    ApiKey,
    QueryParam,
    None,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Default allow/deny policy applied when a mount plan doesn't
    /// specify its own.
    #[serde(default)]
    pub default_policy: ToolPolicy,
    /// Tuning for the built-in `exec`/`process` tools.
    #[serde(default)]
    pub exec: ExecConfig,
}

/// Tuning knobs for the built-in `exec`/`process` tool pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// How long a foreground `exec` waits before auto-backgrounding.
    #[serde(default = "d_background_ms")]
    pub background_ms: u64,
    /// Hard wall-clock timeout before a background process is killed.
    #[serde(default = "d_exec_timeout_sec")]
    pub timeout_sec: u64,
    /// Max bytes retained in a process's combined output buffer.
    #[serde(default = "d_max_output_chars")]
    pub max_output_chars: usize,
    /// Age (ms) after which a finished process session is evicted.
    #[serde(default = "d_cleanup_ms")]
    pub cleanup_ms: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            background_ms: d_background_ms(),
            timeout_sec: d_exec_timeout_sec(),
            max_output_chars: d_max_output_chars(),
            cleanup_ms: d_cleanup_ms(),
        }
    }
}

fn d_background_ms() -> u64 {
    3_000
}
fn d_exec_timeout_sec() -> u64 {
    300
}
fn d_max_output_chars() -> usize {
    1_048_576
}
fn d_cleanup_ms() -> u64 {
    600_000
}

/// Tool allow/deny policy — prefix-based matching.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolPolicy {
    /// Tool name prefixes this session may use. Empty or `["*"]` = unrestricted.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Tool name prefixes this session is denied (evaluated before allow).
    #[serde(default)]
    pub deny: Vec<String>,
}

impl ToolPolicy {
    /// Check whether the given tool name is permitted by this policy.
    /// Matching is case-insensitive; deny always wins over allow.
    pub fn allows(&self, tool_name: &str) -> bool {
        let name = tool_name.to_ascii_lowercase();

        for d in &self.deny {
            let d_lower = d.to_ascii_lowercase();
            if d_lower == "*" || name == d_lower || name.starts_with(&format!("{d_lower}.")) {
                return false;
            }
        }
        if self.allow.is_empty() || self.allow.iter().any(|a| a == "*") {
            return true;
        }
        for a in &self.allow {
            let a_lower = a.to_ascii_lowercase();
            if name == a_lower || name.starts_with(&format!("{a_lower}.")) {
                return true;
            }
        }
        false
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Tool-call loop iterations before the OVER_CAP reminder-and-final
    /// sequence kicks in.
    #[serde(default = "d_25")]
    pub max_iterations: u32,
    /// Turn count after which auto-compaction replaces old history with
    /// a summary.
    #[serde(default = "d_80")]
    pub compaction_max_turns: usize,
    #[serde(default = "d_12")]
    pub compaction_keep_last_turns: usize,
    /// Resubmissions allowed when a provider reports an incomplete
    /// response (e.g. truncated by an internal length cap) before the
    /// orchestrator gives up and returns what it has.
    #[serde(default = "d_3")]
    pub max_continuations: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_iterations: 25, compaction_max_turns: 80, compaction_keep_last_turns: 12, max_continuations: 3 }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Approval
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "d_approval_timeout_ms")]
    pub timeout_ms: u64,
    /// Append-only JSONL audit log of every approval decision (approved,
    /// denied, or timed out). Resolved relative to `data.root`.
    #[serde(default = "d_audit_path")]
    pub audit_log_path: PathBuf,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self { timeout_ms: d_approval_timeout_ms(), audit_log_path: d_audit_path() }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Idle minutes after which a running session is marked `idle`.
    /// `None` disables idle demotion.
    #[serde(default)]
    pub idle_minutes: Option<u32>,
    /// Bounded in-memory subscriber queue depth before the oldest event
    /// is dropped in favor of the newest.
    #[serde(default = "d_256")]
    pub subscriber_queue_depth: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self { idle_minutes: None, subscriber_queue_depth: 256 }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Observability
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "d_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: d_log_level(), json_logs: false }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    8085
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}
fn d_data_root() -> PathBuf {
    PathBuf::from("./data")
}
fn d_timeout_ms() -> u64 {
    600_000
}
fn d_2() -> u32 {
    2
}
fn d_25() -> u32 {
    25
}
fn d_80() -> usize {
    80
}
fn d_12() -> usize {
    12
}
fn d_3() -> u32 {
    3
}
fn d_256() -> usize {
    256
}
fn d_approval_timeout_ms() -> u64 {
    300_000
}
fn d_audit_path() -> PathBuf {
    PathBuf::from("approvals.jsonl")
}
fn d_log_level() -> String {
    "info".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }
        if self.server.host.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }
        if self.llm.providers.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "llm.providers".into(),
                message: "no LLM providers configured".into(),
            });
        }

        let mut seen_ids: HashMap<&str, usize> = HashMap::new();
        for (i, provider) in self.llm.providers.iter().enumerate() {
            if provider.id.is_empty() {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].id"),
                    message: "provider id must not be empty".into(),
                });
            }
            if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://") {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers[{i}].base_url"),
                    message: format!("base_url must start with http:// or https:// (got \"{}\")", provider.base_url),
                });
            }
            if !provider.id.is_empty() {
                if let Some(first) = seen_ids.insert(&provider.id, i) {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Warning,
                        field: format!("llm.providers[{i}].id"),
                        message: format!(
                            "duplicate provider id \"{}\" (first seen at index {first})",
                            provider.id
                        ),
                    });
                }
            }
            let needs_credentials = matches!(provider.auth.mode, AuthMode::ApiKey | AuthMode::QueryParam);
            if needs_credentials {
                let has_env = provider.auth.env.as_ref().is_some_and(|v| !v.is_empty());
                let has_key = provider.auth.key.as_ref().is_some_and(|v| !v.is_empty());
                if !has_env && !has_key {
                    issues.push(ConfigIssue {
                        severity: ConfigSeverity::Error,
                        field: format!("llm.providers[{i}].auth"),
                        message: format!(
                            "provider \"{}\" uses {:?} auth mode but has no auth.env or auth.key configured",
                            provider.id, provider.auth.mode
                        ),
                    });
                }
            }
        }

        if self.server.cors.allowed_origins.len() == 1 && self.server.cors.allowed_origins[0] == "*" {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "server.cors.allowed_origins".into(),
                message: "wildcard \"*\" allows all origins".into(),
            });
        }

        if let Some(rl) = &self.server.rate_limit {
            if rl.requests_per_second == 0 {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "server.rate_limit.requests_per_second".into(),
                    message: "requests_per_second must be greater than 0".into(),
                });
            }
            if rl.burst_size == 0 {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "server.rate_limit.burst_size".into(),
                    message: "burst_size must be greater than 0".into(),
                });
            }
        }

        if self.orchestrator.max_iterations == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "orchestrator.max_iterations".into(),
                message: "max_iterations must be greater than 0".into(),
            });
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            server: ServerConfig { port: 8085, host: "127.0.0.1".into(), ..ServerConfig::default() },
            llm: LlmConfig {
                providers: vec![ProviderConfig {
                    id: "openai".into(),
                    kind: ProviderKind::OpenaiCompat,
                    base_url: "https://api.openai.com/v1".into(),
                    auth: AuthConfig { mode: AuthMode::ApiKey, env: Some("OPENAI_API_KEY".into()), ..AuthConfig::default() },
                    default_model: None,
                    priority: 100,
                }],
                ..LlmConfig::default()
            },
            ..Config::default()
        }
    }

    fn find<'a>(issues: &'a [ConfigIssue], prefix: &str) -> Option<&'a ConfigIssue> {
        issues.iter().find(|e| e.field.starts_with(prefix))
    }

    #[test]
    fn valid_config_has_no_errors() {
        let issues = valid_config().validate();
        let errors: Vec<_> = issues.iter().filter(|e| e.severity == ConfigSeverity::Error).collect();
        assert!(errors.is_empty(), "expected no errors, got: {errors:?}");
    }

    #[test]
    fn zero_port_is_error() {
        let mut cfg = valid_config();
        cfg.server.port = 0;
        assert_eq!(find(&cfg.validate(), "server.port").unwrap().severity, ConfigSeverity::Error);
    }

    #[test]
    fn invalid_base_url_scheme_is_error() {
        let mut cfg = valid_config();
        cfg.llm.providers[0].base_url = "ftp://example.com".into();
        let issues = cfg.validate();
        let issue = find(&issues, "llm.providers[0].base_url").unwrap();
        assert_eq!(issue.severity, ConfigSeverity::Error);
    }

    #[test]
    fn api_key_mode_without_credentials_is_error() {
        let mut cfg = valid_config();
        cfg.llm.providers[0].auth = AuthConfig { mode: AuthMode::ApiKey, env: None, key: None, ..AuthConfig::default() };
        assert_eq!(find(&cfg.validate(), "llm.providers[0].auth").unwrap().severity, ConfigSeverity::Error);
    }

    #[test]
    fn none_auth_mode_requires_no_credentials() {
        let mut cfg = valid_config();
        cfg.llm.providers[0].auth = AuthConfig { mode: AuthMode::None, env: None, key: None, ..AuthConfig::default() };
        assert!(find(&cfg.validate(), "llm.providers[0].auth").is_none());
    }

    #[test]
    fn duplicate_provider_ids_warn() {
        let mut cfg = valid_config();
        let mut second = cfg.llm.providers[0].clone();
        second.auth.env = Some("OPENAI_API_KEY_2".into());
        cfg.llm.providers.push(second);
        let issue = cfg.validate().into_iter().find(|e| e.message.contains("duplicate")).unwrap();
        assert_eq!(issue.severity, ConfigSeverity::Warning);
    }

    #[test]
    fn no_providers_warns() {
        let mut cfg = valid_config();
        cfg.llm.providers.clear();
        assert_eq!(find(&cfg.validate(), "llm.providers").unwrap().severity, ConfigSeverity::Warning);
    }

    #[test]
    fn cors_wildcard_warns() {
        let mut cfg = valid_config();
        cfg.server.cors.allowed_origins = vec!["*".into()];
        assert_eq!(find(&cfg.validate(), "server.cors.allowed_origins").unwrap().severity, ConfigSeverity::Warning);
    }

    #[test]
    fn zero_max_iterations_is_error() {
        let mut cfg = valid_config();
        cfg.orchestrator.max_iterations = 0;
        assert_eq!(find(&cfg.validate(), "orchestrator.max_iterations").unwrap().severity, ConfigSeverity::Error);
    }

    // ── ToolPolicy ───────────────────────────────────────────────────

    #[test]
    fn empty_policy_allows_everything() {
        assert!(ToolPolicy::default().allows("exec.run"));
    }

    #[test]
    fn wildcard_allow_permits_everything() {
        let policy = ToolPolicy { allow: vec!["*".into()], deny: vec![] };
        assert!(policy.allows("anything"));
    }

    #[test]
    fn deny_takes_precedence_over_allow() {
        let policy = ToolPolicy { allow: vec!["exec".into()], deny: vec!["exec.dangerous".into()] };
        assert!(policy.allows("exec.run"));
        assert!(!policy.allows("exec.dangerous.rm"));
    }

    #[test]
    fn allow_matches_prefix_with_dot_boundary() {
        let policy = ToolPolicy { allow: vec!["fs".into()], deny: vec![] };
        assert!(policy.allows("fs.read"));
        assert!(policy.allows("fs"));
        assert!(!policy.allows("fsx.read"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let policy = ToolPolicy { allow: vec!["Exec".into()], deny: vec![] };
        assert!(policy.allows("EXEC.run"));
    }

    #[test]
    fn unmatched_tool_is_denied_when_allowlist_set() {
        let policy = ToolPolicy { allow: vec!["fs".into()], deny: vec![] };
        assert!(!policy.allows("exec.run"));
    }
}
