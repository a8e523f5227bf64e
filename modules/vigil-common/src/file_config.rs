use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::error::VigilError;
use crate::types::SubcategoryRules;

/// TOML-backed rules loaded from disk.
/// Secrets (DB URL) stay as env vars.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub subcategories: Vec<SubcategoryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntakeConfig {
    /// Platform-wide floor on how long a cluster stays open.
    pub min_duration_hours: f64,
    /// How far back the matcher looks for open clusters.
    pub match_window_hours: f64,
    /// Score granted to a voter for every accepted report.
    pub contribution_reward: f64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            min_duration_hours: 24.0,
            match_window_hours: 24.0,
            contribution_reward: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettlementConfig {
    pub win_score: f64,
    pub win_credibility: f64,
    pub loss_score: f64,
    pub loss_credibility: f64,
    /// Inclusive lower bound on final credibility for a "confirmed" outcome.
    pub confirm_threshold: f64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            win_score: 10.0,
            win_credibility: 0.5,
            loss_score: -5.0,
            loss_credibility: -0.2,
            confirm_threshold: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubcategoryEntry {
    pub code: String,
    pub category: String,
    pub match_radius_m: f64,
    pub default_duration_hours: f64,
}

impl From<&SubcategoryEntry> for SubcategoryRules {
    fn from(entry: &SubcategoryEntry) -> Self {
        SubcategoryRules {
            code: entry.code.clone(),
            category: entry.category.clone(),
            match_radius_m: entry.match_radius_m,
            default_duration_hours: entry.default_duration_hours,
        }
    }
}

impl FileConfig {
    /// Reject duplicate codes and non-positive radii/durations.
    pub fn validate(&self) -> Result<(), VigilError> {
        let mut seen = HashSet::new();
        for entry in &self.subcategories {
            if !seen.insert(entry.code.as_str()) {
                return Err(VigilError::Config(format!(
                    "duplicate subcategory code: {}",
                    entry.code
                )));
            }
            if !(entry.match_radius_m > 0.0) {
                return Err(VigilError::Config(format!(
                    "subcategory {}: match_radius_m must be positive",
                    entry.code
                )));
            }
            if !(entry.default_duration_hours > 0.0) {
                return Err(VigilError::Config(format!(
                    "subcategory {}: default_duration_hours must be positive",
                    entry.code
                )));
            }
        }
        if !(self.intake.match_window_hours > 0.0) {
            return Err(VigilError::Config(
                "intake.match_window_hours must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load, parse and validate a TOML rules file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<FileConfig> {
    let config: FileConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}
