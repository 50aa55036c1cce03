//! Group rewriting before impersonation
//!
//! Identity providers and workload clusters rarely agree on group names.
//! The mapper rewrites upstream groups to the names RBAC on the workload
//! clusters is bound to; unmapped groups pass through unchanged.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

/// Invalid mapping configuration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GroupMappingError {
    /// Source or target is empty
    #[error("group mapping {0:?} has an empty source or target")]
    Empty(String),
    /// Source or target has control characters
    #[error("group mapping {0:?} contains control characters")]
    ControlCharacters(String),
    /// Two sources map to the same target
    #[error("group mapping target {target:?} is used by both {first:?} and {second:?}")]
    DuplicateTarget {
        /// Shared target
        target: String,
        /// First source
        first: String,
        /// Second source
        second: String,
    },
    /// Mapping JSON could not be parsed
    #[error("group mappings are not a JSON object of strings: {0}")]
    Parse(String),
}

/// Source to target group rewrite table
#[derive(Debug, Clone, Default)]
pub struct GroupMapper {
    mappings: HashMap<String, String>,
}

impl GroupMapper {
    /// Build a mapper, rejecting ambiguous or malformed entries
    pub fn new(mappings: BTreeMap<String, String>) -> Result<Self, GroupMappingError> {
        let mut targets: HashMap<&str, &str> = HashMap::new();
        for (source, target) in &mappings {
            if source.trim().is_empty() || target.trim().is_empty() {
                return Err(GroupMappingError::Empty(source.clone()));
            }
            if source.chars().any(char::is_control) || target.chars().any(char::is_control) {
                return Err(GroupMappingError::ControlCharacters(source.clone()));
            }
            if let Some(first) = targets.insert(target, source) {
                return Err(GroupMappingError::DuplicateTarget {
                    target: target.clone(),
                    first: first.to_string(),
                    second: source.clone(),
                });
            }
        }
        Ok(Self {
            mappings: mappings.into_iter().collect(),
        })
    }

    /// Parse `{"upstream-group": "cluster-group", ...}`
    pub fn parse_json(raw: &str) -> Result<Self, GroupMappingError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let mappings: BTreeMap<String, String> =
            serde_json::from_str(raw).map_err(|e| GroupMappingError::Parse(e.to_string()))?;
        Self::new(mappings)
    }

    /// Whether any mapping is configured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Rewrite `groups`, dropping duplicates created by the rewrite.
    ///
    /// Returns the mapped groups and whether any mapping applied.
    #[must_use]
    pub fn map_groups(&self, groups: &[String]) -> (Vec<String>, bool) {
        let mut changed = false;
        let mut out: Vec<String> = Vec::with_capacity(groups.len());
        for group in groups {
            let mapped = match self.mappings.get(group) {
                Some(target) => {
                    changed = true;
                    target
                }
                None => group,
            };
            if !out.iter().any(|g| g == mapped) {
                out.push(mapped.clone());
            }
        }
        (out, changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(pairs: &[(&str, &str)]) -> Result<GroupMapper, GroupMappingError> {
        GroupMapper::new(pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect())
    }

    #[test]
    fn maps_and_passes_through() {
        // GIVEN
        let m = mapper(&[("okta:platform", "platform-admins")]).unwrap();
        let groups = vec!["okta:platform".to_string(), "developers".to_string()];

        // WHEN
        let (mapped, changed) = m.map_groups(&groups);

        // THEN
        assert!(changed);
        assert_eq!(mapped, vec!["platform-admins", "developers"]);
    }

    #[test]
    fn unchanged_when_nothing_matches() {
        let m = mapper(&[("a", "b")]).unwrap();
        let (mapped, changed) = m.map_groups(&["c".to_string()]);
        assert!(!changed);
        assert_eq!(mapped, vec!["c"]);
    }

    #[test]
    fn collapses_duplicates_created_by_mapping() {
        let m = mapper(&[("okta:admins", "admins")]).unwrap();
        let (mapped, _) = m.map_groups(&["admins".to_string(), "okta:admins".to_string()]);
        assert_eq!(mapped, vec!["admins"]);
    }

    #[test]
    fn rejects_invalid_tables() {
        assert!(matches!(mapper(&[("", "x")]), Err(GroupMappingError::Empty(_))));
        assert!(matches!(mapper(&[("a\n", "x")]), Err(GroupMappingError::ControlCharacters(_))));
        assert!(matches!(
            mapper(&[("a", "x"), ("b", "x")]),
            Err(GroupMappingError::DuplicateTarget { .. })
        ));
    }

    #[test]
    fn parses_json() {
        let m = GroupMapper::parse_json(r#"{"okta:sre": "sre"}"#).unwrap();
        assert!(!m.is_empty());
        assert!(GroupMapper::parse_json("").unwrap().is_empty());
        assert!(matches!(GroupMapper::parse_json("[1]"), Err(GroupMappingError::Parse(_))));
    }
}
