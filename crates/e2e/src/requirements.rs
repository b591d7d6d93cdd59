//! Requirement declarations that the executed steps must cover

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{E2eError, E2eResult};

/// One declared requirement
#[derive(Debug, Clone, Deserialize)]
pub struct RequirementEntry {
    pub id: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RequirementFile {
    List(Vec<RequirementEntry>),
    Wrapped { requirements: Vec<RequirementEntry> },
}

/// The set of requirement ids that must each be touched by a step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequirementSet {
    ids: BTreeSet<String>,
}

impl RequirementSet {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a YAML (or JSON) declaration: either a list of entries or a
    /// mapping with a `requirements` list.
    pub fn from_yaml(yaml: &str) -> E2eResult<Self> {
        let entries = match serde_yaml::from_str::<RequirementFile>(yaml)? {
            RequirementFile::List(entries) => entries,
            RequirementFile::Wrapped { requirements } => requirements,
        };

        if let Some(blank) = entries.iter().find(|e| e.id.trim().is_empty()) {
            return Err(E2eError::InvalidConfig(format!(
                "requirement with empty id ({:?})",
                blank.description
            )));
        }

        Ok(Self::new(entries.into_iter().map(|e| e.id)))
    }

    pub fn load(path: &Path) -> E2eResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            E2eError::InvalidConfig(format!(
                "cannot read requirements file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn ids(&self) -> &BTreeSet<String> {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Declared ids absent from `covered`
    pub fn missing(&self, covered: &BTreeSet<String>) -> Vec<String> {
        self.ids.difference(covered).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let set = RequirementSet::from_yaml(
            r#"
- id: REQ-BACKEND-HEALTH
  description: Backend answers /api/data
- id: REQ-CHAMPIONS-API
- id: REQ-BACKEND-HEALTH
"#,
        )
        .unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.ids().contains("REQ-CHAMPIONS-API"));
    }

    #[test]
    fn test_parse_wrapped_json() {
        let set = RequirementSet::from_yaml(
            r#"{"requirements": [{"id": "REQ-FRONTEND-AVAILABLE", "description": "GET /"}]}"#,
        )
        .unwrap();
        assert_eq!(set, RequirementSet::new(["REQ-FRONTEND-AVAILABLE"]));
    }

    #[test]
    fn test_empty_id_rejected() {
        let err = RequirementSet::from_yaml("- id: ''\n  description: nothing\n").unwrap_err();
        assert!(matches!(err, E2eError::InvalidConfig(_)));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = RequirementSet::load(Path::new("/nonexistent/requirements.yaml")).unwrap_err();
        assert!(matches!(err, E2eError::InvalidConfig(_)));
    }

    #[test]
    fn test_missing() {
        let set = RequirementSet::new(["REQ-A", "REQ-B", "REQ-C"]);
        let covered = BTreeSet::from(["REQ-B".to_string(), "REQ-X".to_string()]);
        assert_eq!(set.missing(&covered), vec!["REQ-A".to_string(), "REQ-C".to_string()]);
    }
}
