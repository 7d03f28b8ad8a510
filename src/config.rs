// src/config.rs
// All knobs overridable from the environment; defaults suit a local game install.

use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;

/// Process-wide default configuration, resolved once from the environment.
pub static CONFIG: Lazy<MemoryConfig> = Lazy::new(MemoryConfig::from_env);

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Root for unit documents (`<data_root>/memory`) and index files
    /// (`<data_root>/index`).
    pub data_root: PathBuf,

    // ── Short-term window
    /// Entries retained per unit before compaction triggers.
    pub short_max: usize,
    /// Oldest entries folded into one chunk per compaction pass.
    pub chunk_turns: usize,

    // ── Embedding
    pub ollama_base_url: String,
    pub ollama_model: String,
    /// Expected vector dimensionality; a backend returning anything else is
    /// treated as unavailable for that call.
    pub embed_dim: usize,
    pub embed_timeout: Duration,

    // ── Retrieval
    pub short_limit: usize,
    pub long_limit: usize,
    pub retrieved_limit: usize,
    /// Time constant (hours) of the exponential recency decay,
    /// `exp(-age_hours / tau)`.
    pub recency_tau_hours: f32,

    // ── Locking
    /// How long a caller waits on a unit's exclusive lock before
    /// `LockContention`.
    pub lock_wait: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            short_max: 60,
            chunk_turns: 40,
            ollama_base_url: "http://127.0.0.1:11434".to_string(),
            ollama_model: "nomic-embed-text".to_string(),
            embed_dim: 768,
            embed_timeout: Duration::from_secs(8),
            short_limit: 8,
            long_limit: 12,
            retrieved_limit: 10,
            recency_tau_hours: 240.0,
            lock_wait: Duration::from_secs(5),
        }
    }
}

impl MemoryConfig {
    pub fn from_env() -> Self {
        let base = Self::default();
        Self {
            data_root: env_var("KEEPSAKE_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or(base.data_root),
            short_max: env_parse("KEEPSAKE_SHORT_MAX", base.short_max).clamp(20, 240),
            chunk_turns: env_parse("KEEPSAKE_CHUNK_TURNS", base.chunk_turns).clamp(10, 120),
            ollama_base_url: env_var("KEEPSAKE_OLLAMA_URL").unwrap_or(base.ollama_base_url),
            ollama_model: env_var("KEEPSAKE_OLLAMA_MODEL").unwrap_or(base.ollama_model),
            embed_dim: env_parse("KEEPSAKE_EMBED_DIM", base.embed_dim),
            embed_timeout: Duration::from_millis(env_parse(
                "KEEPSAKE_EMBED_TIMEOUT_MS",
                base.embed_timeout.as_millis() as u64,
            )),
            short_limit: env_parse("KEEPSAKE_SHORT_LIMIT", base.short_limit),
            long_limit: env_parse("KEEPSAKE_LONG_LIMIT", base.long_limit),
            retrieved_limit: env_parse("KEEPSAKE_RETRIEVED_LIMIT", base.retrieved_limit),
            recency_tau_hours: env_parse("KEEPSAKE_RECENCY_TAU_HOURS", base.recency_tau_hours),
            lock_wait: Duration::from_millis(env_parse(
                "KEEPSAKE_LOCK_WAIT_MS",
                base.lock_wait.as_millis() as u64,
            )),
        }
    }

    /// Config rooted at an explicit directory; used by the CLI and tests.
    pub fn at_root(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            ..Self::default()
        }
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
