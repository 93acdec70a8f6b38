//! Engine configuration.
//!
//! Loaded from TOML (by default `config/default.toml`). Every section and
//! field is optional; missing values fall back to the [`Default`] impls.
//!
//! ```toml
//! [frame_manager]
//! pattern_capacity = 10000
//! pattern_idle_seconds = 86400
//! base_weight = 0.7
//! size_weight = 0.3
//!
//! [change_tracker]
//! scope = "user"
//! max_count = 1000
//! expire_after_seconds = 604800
//!
//! [storage]
//! path = "data/turnstate.db"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::access::{AccessPatternCache, DEFAULT_PATTERN_CAPACITY, WeightedScorer};
use crate::change_tracker::ChangeTrackerConfig;
use crate::error::{EngineError, Result};
use crate::frame_manager::FrameManagerMiddleware;
use crate::root_frame::RootFrame;

/// Default location of the configuration file, relative to the working dir.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub frame_manager: FrameManagerConfig,
    pub change_tracker: ChangeTrackerConfig,
    pub storage: StorageConfig,
}

/// `[frame_manager]`: access-pattern learning and preload scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameManagerConfig {
    /// Maximum number of distinct access patterns remembered.
    pub pattern_capacity: u64,
    /// Forget patterns unused for this long. Unset keeps them until evicted.
    pub pattern_idle_seconds: Option<u64>,
    pub base_weight: f64,
    pub size_weight: f64,
}

impl Default for FrameManagerConfig {
    fn default() -> Self {
        let scorer = WeightedScorer::default();
        Self {
            pattern_capacity: DEFAULT_PATTERN_CAPACITY,
            pattern_idle_seconds: None,
            base_weight: scorer.base_weight,
            size_weight: scorer.size_weight,
        }
    }
}

impl FrameManagerConfig {
    pub fn scorer(&self) -> WeightedScorer {
        WeightedScorer {
            base_weight: self.base_weight,
            size_weight: self.size_weight,
        }
    }

    pub fn access_patterns(&self) -> AccessPatternCache {
        let mut builder = AccessPatternCache::builder().max_capacity(self.pattern_capacity);
        if let Some(secs) = self.pattern_idle_seconds {
            builder = builder.idle_seconds(secs);
        }
        builder.build()
    }

    /// A frame manager over `frames` configured from this section.
    pub fn build(&self, frames: Vec<Arc<RootFrame>>) -> FrameManagerMiddleware {
        FrameManagerMiddleware::new(frames)
            .with_access_patterns(self.access_patterns())
            .with_scorer(Arc::new(self.scorer()))
    }
}

/// `[storage]`: where the durable backend keeps its database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file. Unset means in-memory storage.
    pub path: Option<PathBuf>,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate the TOML file at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "engine config loaded");
        Ok(config)
    }

    /// Load `path` if it exists, otherwise return the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::from_file(path)
        } else {
            debug!(path = %path.display(), "no config file; using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fm = &self.frame_manager;
        for (name, weight) in [("base_weight", fm.base_weight), ("size_weight", fm.size_weight)] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(EngineError::Config(format!(
                    "frame_manager.{name} must be a non-negative number, got {weight}"
                )));
            }
        }
        if fm.pattern_capacity == 0 {
            return Err(EngineError::Config(
                "frame_manager.pattern_capacity must be at least 1".into(),
            ));
        }
        if self.change_tracker.max_count == 0 {
            return Err(EngineError::Config(
                "change_tracker.max_count must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::FrameScope;
    use std::io::Write;

    #[test]
    fn empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.change_tracker.max_count, 1000);
        assert_eq!(config.frame_manager.scorer(), WeightedScorer::default());
    }

    #[test]
    fn parses_all_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            [frame_manager]
            pattern_capacity = 50
            pattern_idle_seconds = 60
            base_weight = 1.0
            size_weight = 0.0

            [change_tracker]
            scope = "conversationMember"
            namespace = "audit"
            max_count = 10
            expire_after_seconds = 3600

            [storage]
            path = "state.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.frame_manager.pattern_capacity, 50);
        assert_eq!(config.frame_manager.pattern_idle_seconds, Some(60));
        assert_eq!(config.change_tracker.scope, FrameScope::ConversationMember);
        assert_eq!(config.change_tracker.namespace.as_deref(), Some("audit"));
        assert_eq!(config.change_tracker.expire_after_seconds, Some(3600));
        assert_eq!(config.storage.path, Some(PathBuf::from("state.db")));
    }

    #[test]
    fn rejects_unknown_scope_and_bad_weights() {
        assert!(matches!(
            EngineConfig::from_toml_str("[change_tracker]\nscope = \"channel\""),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[frame_manager]\nbase_weight = -1.0"),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[change_tracker]\nmax_count = 0"),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn loads_from_file_or_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert_eq!(
            EngineConfig::load_or_default(&missing).unwrap(),
            EngineConfig::default()
        );

        let path = dir.path().join("engine.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[storage]\npath = \"x.db\"").unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.storage.path, Some(PathBuf::from("x.db")));

        assert!(matches!(
            EngineConfig::from_file(&missing),
            Err(EngineError::Config(_))
        ));
    }
}
