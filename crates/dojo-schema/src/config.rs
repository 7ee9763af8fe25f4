use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Prefix marking a secret that is read from the environment.
pub const SECRET_ENV_PREFIX: &str = "env:";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("{0}.endpoint must not be empty")]
    EmptyEndpoint(&'static str),
    #[error("retry.max_attempts must be at least 1")]
    NoAttempts,
    #[error("retry.base_delay_ms must not exceed retry.max_delay_ms")]
    InvertedDelays,
    #[error("credentials.password_length must be between 4 and 50, got {0}")]
    PasswordLength(usize),
    #[error("secret references environment variable '{0}', which is not set")]
    MissingSecret(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DojoConfig {
    pub identity: IdentitySection,
    pub cluster: ClusterSection,
    #[serde(default)]
    pub chaos: Option<ChaosSection>,
    #[serde(default)]
    pub ticket: Option<TicketSection>,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub credentials: CredentialSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IdentitySection {
    pub endpoint: String,
    #[serde(default = "default_realm")]
    pub realm: String,
    pub admin_user: String,
    pub admin_password: String,
    #[serde(default = "default_email_domain")]
    pub email_domain: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ClusterSection {
    pub endpoint: String,
    pub token: String,
    #[serde(default = "default_cluster_role")]
    pub cluster_role: String,
    /// Prepended to usernames in RoleBinding subjects (e.g. the OIDC username prefix).
    #[serde(default)]
    pub user_prefix: String,
    #[serde(default)]
    pub quota: QuotaSection,
}

/// Per-participant resource quota; the namespace quota is this times the participant count.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct QuotaSection {
    #[serde(default = "default_cpu_millis")]
    pub cpu_millis: u32,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: u32,
    #[serde(default = "default_pods")]
    pub pods: u32,
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            cpu_millis: default_cpu_millis(),
            memory_mb: default_memory_mb(),
            pods: default_pods(),
        }
    }
}

impl QuotaSection {
    #[must_use]
    pub fn scaled(&self, participants: u32) -> Self {
        Self {
            cpu_millis: self.cpu_millis.saturating_mul(participants),
            memory_mb: self.memory_mb.saturating_mul(participants),
            pods: self.pods.saturating_mul(participants),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ChaosFault {
    PodDelete,
    NetworkLatency,
    CpuHog,
}

impl fmt::Display for ChaosFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChaosFault::PodDelete => write!(f, "pod-delete"),
            ChaosFault::NetworkLatency => write!(f, "pod-network-latency"),
            ChaosFault::CpuHog => write!(f, "pod-cpu-hog"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ChaosSection {
    pub endpoint: String,
    pub api_key: String,
    pub account_id: String,
    #[serde(default = "default_org")]
    pub org_id: String,
    pub project_id: String,
    /// Chaos infrastructure registered for the workshop cluster.
    pub infra_id: String,
    #[serde(default = "default_fault")]
    pub fault: ChaosFault,
    #[serde(default = "default_chaos_duration")]
    pub duration_secs: u32,
    #[serde(default = "default_target_app")]
    pub target_app: String,
    #[serde(default)]
    pub probe_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TicketSection {
    /// ServiceNow instance name (`<instance>.service-now.com`).
    #[serde(default)]
    pub instance: Option<String>,
    /// Explicit base URL; takes precedence over `instance`.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub assignment_group: Option<String>,
}

impl TicketSection {
    pub fn base_url(&self) -> Option<String> {
        if let Some(ref url) = self.endpoint {
            return Some(url.trim_end_matches('/').to_owned());
        }
        self.instance
            .as_ref()
            .map(|i| format!("https://{i}.service-now.com"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl RetrySection {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CredentialSection {
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u32,
    #[serde(default = "default_password_length")]
    pub password_length: usize,
}

impl Default for CredentialSection {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            password_length: default_password_length(),
        }
    }
}

fn default_realm() -> String {
    "workshop".to_owned()
}

fn default_email_domain() -> String {
    "workshop.local".to_owned()
}

fn default_cluster_role() -> String {
    "edit".to_owned()
}

fn default_cpu_millis() -> u32 {
    2000
}

fn default_memory_mb() -> u32 {
    4096
}

fn default_pods() -> u32 {
    20
}

fn default_org() -> String {
    "default".to_owned()
}

fn default_fault() -> ChaosFault {
    ChaosFault::PodDelete
}

fn default_chaos_duration() -> u32 {
    60
}

fn default_target_app() -> String {
    "frontend".to_owned()
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_ttl_hours() -> u32 {
    8
}

fn default_password_length() -> usize {
    12
}

impl DojoConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.endpoint.trim().is_empty() {
            return Err(ConfigError::EmptyEndpoint("identity"));
        }
        if self.cluster.endpoint.trim().is_empty() {
            return Err(ConfigError::EmptyEndpoint("cluster"));
        }
        if let Some(ref chaos) = self.chaos {
            if chaos.endpoint.trim().is_empty() {
                return Err(ConfigError::EmptyEndpoint("chaos"));
            }
        }
        if let Some(ref ticket) = self.ticket {
            match ticket.base_url() {
                Some(url) if !url.trim().is_empty() => {}
                _ => return Err(ConfigError::EmptyEndpoint("ticket")),
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvertedDelays);
        }
        let len = self.credentials.password_length;
        if !(4..=50).contains(&len) {
            return Err(ConfigError::PasswordLength(len));
        }
        Ok(())
    }
}

/// Resolve a secret value: `env:NAME` reads `$NAME`, anything else is literal.
pub fn resolve_secret(value: &str) -> Result<String, ConfigError> {
    match value.strip_prefix(SECRET_ENV_PREFIX) {
        Some(var) => {
            std::env::var(var).map_err(|_| ConfigError::MissingSecret(var.to_owned()))
        }
        None => Ok(value.to_owned()),
    }
}

pub fn parse_config_str(input: &str) -> Result<DojoConfig, ConfigError> {
    let config: DojoConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<DojoConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[identity]
endpoint = "https://sso.example.com"
admin_user = "admin"
admin_password = "env:DOJO_TEST_UNSET_SECRET"

[cluster]
endpoint = "https://k8s.example.com:6443"
token = "abc"
"#;

    #[test]
    fn parses_minimal_config() {
        let config = parse_config_str(MINIMAL).unwrap();
        assert_eq!(config.identity.realm, "workshop");
        assert_eq!(config.cluster.cluster_role, "edit");
        assert_eq!(config.cluster.quota, QuotaSection::default());
        assert!(config.chaos.is_none());
        assert!(config.ticket.is_none());
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.credentials.password_length, 12);
    }

    #[test]
    fn parses_full_config() {
        let input = r#"
[identity]
endpoint = "https://sso.example.com"
realm = "labs"
admin_user = "admin"
admin_password = "pw"
email_domain = "labs.example.com"

[cluster]
endpoint = "https://k8s.example.com:6443"
token = "abc"
cluster_role = "admin"
user_prefix = "oidc:"

[cluster.quota]
cpu_millis = 1000
memory_mb = 2048
pods = 10

[chaos]
endpoint = "https://app.harness.io"
api_key = "key"
account_id = "acct"
project_id = "proj"
infra_id = "infra-1"
fault = "network-latency"
duration_secs = 120
target_app = "checkout"
probe_url = "http://checkout:8080/health"

[ticket]
instance = "dev123"
username = "svc"
password = "pw"

[retry]
max_attempts = 5
base_delay_ms = 500
max_delay_ms = 10000
call_timeout_secs = 10

[credentials]
ttl_hours = 4
password_length = 16
"#;
        let config = parse_config_str(input).unwrap();
        assert_eq!(config.identity.realm, "labs");
        assert_eq!(config.cluster.quota.pods, 10);
        let chaos = config.chaos.unwrap();
        assert_eq!(chaos.fault, ChaosFault::NetworkLatency);
        assert_eq!(chaos.org_id, "default");
        assert_eq!(
            config.ticket.unwrap().base_url().as_deref(),
            Some("https://dev123.service-now.com")
        );
        assert_eq!(config.retry.call_timeout(), Duration::from_secs(10));
        assert_eq!(config.credentials.ttl_hours, 4);
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = format!("{MINIMAL}\n[extra]\nkey = 1\n");
        assert!(parse_config_str(&input).is_err());
    }

    #[test]
    fn rejects_zero_attempts() {
        let input = format!("{MINIMAL}\n[retry]\nmax_attempts = 0\n");
        assert!(matches!(
            parse_config_str(&input),
            Err(ConfigError::NoAttempts)
        ));
    }

    #[test]
    fn rejects_inverted_delays() {
        let input = format!("{MINIMAL}\n[retry]\nbase_delay_ms = 5000\nmax_delay_ms = 100\n");
        assert!(matches!(
            parse_config_str(&input),
            Err(ConfigError::InvertedDelays)
        ));
    }

    #[test]
    fn rejects_empty_endpoint() {
        let input = MINIMAL.replace("https://sso.example.com", " ");
        assert!(matches!(
            parse_config_str(&input),
            Err(ConfigError::EmptyEndpoint("identity"))
        ));
    }

    #[test]
    fn ticket_endpoint_overrides_instance() {
        let ticket = TicketSection {
            instance: Some("dev1".to_owned()),
            endpoint: Some("http://127.0.0.1:9000/servicenow/".to_owned()),
            username: "u".to_owned(),
            password: "p".to_owned(),
            assignment_group: None,
        };
        assert_eq!(
            ticket.base_url().as_deref(),
            Some("http://127.0.0.1:9000/servicenow")
        );
    }

    #[test]
    fn quota_scales_with_participants() {
        let quota = QuotaSection::default().scaled(3);
        assert_eq!(quota.cpu_millis, 6000);
        assert_eq!(quota.memory_mb, 12288);
        assert_eq!(quota.pods, 60);
    }

    #[test]
    fn resolve_literal_and_missing_env_secret() {
        assert_eq!(resolve_secret("plain").unwrap(), "plain");
        assert!(matches!(
            resolve_secret("env:DOJO_TEST_UNSET_SECRET"),
            Err(ConfigError::MissingSecret(_))
        ));
    }

    #[test]
    fn resolve_env_secret() {
        let path = std::env::var("PATH").unwrap();
        assert_eq!(resolve_secret("env:PATH").unwrap(), path);
    }

    #[test]
    fn fault_names() {
        assert_eq!(ChaosFault::PodDelete.to_string(), "pod-delete");
        assert_eq!(ChaosFault::CpuHog.to_string(), "pod-cpu-hog");
    }
}
