//! Shared configuration fragments, composed by each binary's own `Settings`
//! struct via `#[command(flatten)]`. Each binary builds exactly one
//! immutable `Settings` at startup from `clap::Parser` + environment
//! variables (after `dotenvy::dotenv()` has loaded a local `.env`), never
//! mutated afterward — see SPEC_FULL.md §9/§10.

use clap::Args;
use secrecy::SecretString;

#[derive(Debug, Clone, Args)]
pub struct DatabaseSettings {
    #[arg(long, env = "DATABASE_DSN")]
    pub database_dsn: SecretString,

    #[arg(long, env = "DATABASE_POOL_SIZE", default_value_t = 10)]
    pub database_pool_size: usize,
}

#[derive(Debug, Clone, Args)]
pub struct BrokerSettings {
    #[arg(long, env = "RABBITMQ_DSN")]
    pub rabbitmq_dsn: SecretString,

    #[arg(long, env = "RABBITMQ_QUEUE", default_value = "instancer.jobs")]
    pub rabbitmq_queue: String,

    #[arg(long, env = "RABBITMQ_QUEUE_SUFFIX")]
    pub rabbitmq_queue_suffix: Option<String>,

    #[arg(long, env = "RABBITMQ_QUEUE_TTL_SECONDS")]
    pub rabbitmq_queue_ttl_seconds: Option<u64>,

    #[arg(long, env = "RABBITMQ_QUEUE_DLQ")]
    pub rabbitmq_queue_dlq: Option<String>,

    #[arg(long, env = "INSTANCER_MAX_CONCURRENT_JOBS")]
    pub max_concurrent_jobs: Option<usize>,

    #[arg(long, env = "INSTANCER_POLL_SECONDS", default_value_t = 2)]
    pub poll_seconds: u64,
}

impl BrokerSettings {
    /// Queue name with the `.limited` suffix auto-applied when a concurrency
    /// cap is configured and no explicit suffix was given — so capped and
    /// uncapped deployments never collide on the same queue.
    pub fn effective_queue_name(&self) -> String {
        let suffix = self.rabbitmq_queue_suffix.clone().or_else(|| {
            self.max_concurrent_jobs
                .filter(|n| *n > 0)
                .map(|_| "limited".to_string())
        });
        match suffix {
            Some(s) if !s.is_empty() => format!("{}.{}", self.rabbitmq_queue, s),
            _ => self.rabbitmq_queue.clone(),
        }
    }

    pub fn dlq_name(&self, instancer_job_dlq: Option<&str>) -> String {
        if let Some(name) = &self.rabbitmq_queue_dlq {
            return name.clone();
        }
        if let Some(name) = instancer_job_dlq {
            return name.to_string();
        }
        format!("{}.dlq", self.effective_queue_name())
    }
}

/// Models accepted directly (non-OpenRouter-routed).
pub const ALLOWED_MODELS: &[&str] = &["codex-gpt-5.1-codex-max", "codex-gpt-5.2"];

/// Models accepted when `provider=openrouter`.
pub const OPENROUTER_ALLOWED_MODELS: &[&str] = &[
    "openai/gpt-5.2-codex",
    "openai/gpt-5.1-codex",
    "openai/gpt-5.1-codex-max",
    "openai/gpt-5.2",
    "openai/gpt-5.1",
    "anthropic/claude-opus-4-5",
    "anthropic/claude-sonnet-4-5",
    "google/gemini-2.5-pro",
    "google/gemini-2.5-flash",
    "deepseek/deepseek-r1",
    "deepseek/deepseek-chat",
];

pub const ALLOWED_PROVIDERS: &[&str] = &["openai", "openrouter"];

pub fn is_model_allowed(model: &str, provider: Option<&str>) -> bool {
    match provider {
        Some("openrouter") => OPENROUTER_ALLOWED_MODELS.contains(&model),
        _ => ALLOWED_MODELS.contains(&model),
    }
}

/// Installs the process-wide `tracing` subscriber. Every binary calls this
/// once, first thing in `main`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(queue: &str, suffix: Option<&str>, cap: Option<usize>) -> BrokerSettings {
        BrokerSettings {
            rabbitmq_dsn: SecretString::from("amqp://localhost".to_string()),
            rabbitmq_queue: queue.to_string(),
            rabbitmq_queue_suffix: suffix.map(str::to_string),
            rabbitmq_queue_ttl_seconds: None,
            rabbitmq_queue_dlq: None,
            max_concurrent_jobs: cap,
            poll_seconds: 2,
        }
    }

    #[test]
    fn capped_queue_gets_limited_suffix_by_default() {
        let b = broker("instancer.jobs", None, Some(4));
        assert_eq!(b.effective_queue_name(), "instancer.jobs.limited");
    }

    #[test]
    fn uncapped_queue_has_no_suffix() {
        let b = broker("instancer.jobs", None, None);
        assert_eq!(b.effective_queue_name(), "instancer.jobs");
    }

    #[test]
    fn explicit_suffix_wins_over_cap_default() {
        let b = broker("instancer.jobs", Some("canary"), Some(4));
        assert_eq!(b.effective_queue_name(), "instancer.jobs.canary");
    }

    #[test]
    fn dlq_name_falls_back_through_chain() {
        let mut b = broker("instancer.jobs", None, None);
        assert_eq!(b.dlq_name(None), "instancer.jobs.dlq");
        assert_eq!(b.dlq_name(Some("legacy.dlq")), "legacy.dlq");
        b.rabbitmq_queue_dlq = Some("explicit.dlq".to_string());
        assert_eq!(b.dlq_name(Some("legacy.dlq")), "explicit.dlq");
    }

    #[test]
    fn openrouter_models_only_allowed_under_that_provider() {
        assert!(is_model_allowed("codex-gpt-5.2", None));
        assert!(!is_model_allowed("openai/gpt-5.2", None));
        assert!(is_model_allowed("openai/gpt-5.2", Some("openrouter")));
    }
}
