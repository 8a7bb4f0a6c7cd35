use serde::{Deserialize, Serialize};

use crate::sandbox::limits::{
    clamp_memory_limit_mb, clamp_timeout_ms, DEFAULT_MEMORY_LIMIT_MB, DEFAULT_TIMEOUT_MS,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandkitConfig {
    pub engine: EngineConfig,
    pub analyzer: AnalyzerConfig,
}

impl SandkitConfig {
    /// Pull every configurable limit back inside the enforced bounds.
    pub fn normalized(mut self) -> Self {
        self.engine = self.engine.normalized();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Memory ceiling applied when a request does not set one (MB)
    pub default_memory_limit_mb: u32,
    /// Time budget applied when a request does not set one (ms)
    pub default_timeout_ms: u64,
    /// Maximum number of environments checked out at the same time
    pub max_live_environments: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_live_environments: 32,
        }
    }
}

impl EngineConfig {
    pub fn normalized(self) -> Self {
        Self {
            default_memory_limit_mb: clamp_memory_limit_mb(self.default_memory_limit_mb),
            default_timeout_ms: clamp_timeout_ms(self.default_timeout_ms),
            max_live_environments: self.max_live_environments.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Language tag used when `analyze` is called without one
    pub default_language: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            default_language: "javascript".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_clamps_into_bounds() {
        let config = SandkitConfig {
            engine: EngineConfig {
                default_memory_limit_mb: 4096,
                default_timeout_ms: 5,
                max_live_environments: 0,
            },
            ..Default::default()
        }
        .normalized();

        assert_eq!(config.engine.default_memory_limit_mb, 512);
        assert_eq!(config.engine.default_timeout_ms, 100);
        assert_eq!(config.engine.max_live_environments, 1);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SandkitConfig = toml::from_str("[engine]\ndefault_timeout_ms = 2500\n").unwrap();
        assert_eq!(config.engine.default_timeout_ms, 2500);
        assert_eq!(config.engine.default_memory_limit_mb, 128);
        assert_eq!(config.analyzer.default_language, "javascript");
    }

    #[test]
    fn test_parse_budget_is_not_configurable() {
        // structured-data parsing always runs under PARSE_TIMEOUT_MS
        let config: SandkitConfig =
            toml::from_str("[engine]\nparse_timeout_ms = 30000\n").unwrap();
        let serialized = toml::to_string(&config).unwrap();
        assert!(!serialized.contains("parse_timeout_ms"));
    }
}
