use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::CompileError;

/// How contributing rules are grouped into provenance relations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceMode {
    /// One provenance relation per mapping. A mapping with several heads
    /// shares one relation between its targets.
    #[default]
    Union,
    /// One provenance relation per target relation, with the columns of all
    /// contributing mappings aligned and padded with nulls.
    OuterUnion,
    /// Provenance relations as in `Union`, plus one view per target relation
    /// that outer joins every target tuple with the provenance rows of each
    /// mapping into it.
    OuterJoin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub provenance: ProvenanceMode,
    /// Also derive the inverse of every invertible mapping.
    pub bidirectional: bool,
    /// Guard every insertion with an implicit negated self-atom.
    pub set_semantics: bool,
    /// Inline the iteration counter as a literal instead of a `?1` parameter.
    pub inline_iteration: bool,
    pub merge_statements: bool,
    /// Upper bound in bytes on the text of a merged statement.
    pub merge_limit: usize,
    pub max_iterations: usize,
    /// Characters of each argument kept in a Skolem value.
    pub skolem_width: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provenance: ProvenanceMode::Union,
            bidirectional: false,
            set_semantics: true,
            inline_iteration: false,
            merge_statements: true,
            merge_limit: 8192,
            max_iterations: 1000,
            skolem_width: 64,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CompileError> {
        match self.provenance {
            ProvenanceMode::OuterUnion | ProvenanceMode::OuterJoin if self.bidirectional => {
                return Err(CompileError::UnsupportedConfig(format!(
                    "bidirectional mappings cannot be combined with {:?} provenance",
                    self.provenance
                )));
            }
            _ => {}
        }
        if self.merge_statements && self.merge_limit == 0 {
            return Err(CompileError::UnsupportedConfig(
                "statement merging needs a positive merge limit".to_owned(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(CompileError::UnsupportedConfig(
                "max_iterations must be positive".to_owned(),
            ));
        }
        if self.skolem_width == 0 {
            return Err(CompileError::UnsupportedConfig(
                "skolem_width must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_bidirectional_outer_union_rejected() {
        let config = EngineConfig {
            bidirectional: true,
            provenance: ProvenanceMode::OuterUnion,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(CompileError::UnsupportedConfig(_))
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"provenance": "outer_union", "inline_iteration": true}"#)
                .unwrap();
        assert_eq!(config.provenance, ProvenanceMode::OuterUnion);
        assert!(config.inline_iteration);
        assert!(config.set_semantics);
        assert_eq!(config.merge_limit, 8192);

        let config: EngineConfig = serde_json::from_str(r#"{"provenance": "outer_join", "bidirectional": true}"#).unwrap();
        assert_eq!(config.provenance, ProvenanceMode::OuterJoin);
        assert!(matches!(
            config.validate(),
            Err(CompileError::UnsupportedConfig(_))
        ));
    }
}
