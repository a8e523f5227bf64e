use std::collections::HashMap;

use async_trait::async_trait;
use vigil_common::{FileConfig, SubcategoryRules};

use crate::error::Result;
use crate::traits::SubcategoryCatalog;

/// Subcategory rules held in memory, loaded from the TOML config.
#[derive(Debug, Clone, Default)]
pub struct FileCatalog {
    rules: HashMap<String, SubcategoryRules>,
}

impl FileCatalog {
    pub fn from_config(config: &FileConfig) -> Self {
        Self::from_rules(config.subcategories.iter().map(SubcategoryRules::from))
    }

    pub fn from_rules(rules: impl IntoIterator<Item = SubcategoryRules>) -> Self {
        Self {
            rules: rules.into_iter().map(|r| (r.code.clone(), r)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[async_trait]
impl SubcategoryCatalog for FileCatalog {
    async fn rules(&self, code: &str) -> Result<Option<SubcategoryRules>> {
        Ok(self.rules.get(code).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_common::file_config::parse_config;

    #[tokio::test]
    async fn lookups_come_from_config() {
        let config = parse_config(
            r#"
            [[subcategories]]
            code = "traffic.collision"
            category = "traffic"
            match_radius_m = 150.0
            default_duration_hours = 6.0
            "#,
        )
        .unwrap();
        let catalog = FileCatalog::from_config(&config);

        assert_eq!(catalog.len(), 1);
        assert_eq!(
            catalog.match_radius_m("traffic.collision").await.unwrap(),
            Some(150.0)
        );
        assert_eq!(
            catalog.default_duration_hours("traffic.collision").await.unwrap(),
            Some(6.0)
        );
        assert!(catalog.rules("wildlife.bear").await.unwrap().is_none());
    }
}
