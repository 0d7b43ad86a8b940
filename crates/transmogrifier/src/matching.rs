//! Subscription filter matching (§3 Filter, §4.6 step 4).

use grid_models::{DataIdentifier, Filter, MetadataMatcher};
use regex::Regex;

/// `true` iff `filter` matches `did` given its resolved `metadata`. An
/// unknown metadata-key filter with no corresponding DID-metadata entry
/// fails the match rather than being ignored.
pub fn is_matching(filter: &Filter, did: &DataIdentifier) -> bool {
    if let Some(pattern) = &filter.pattern {
        match Regex::new(pattern) {
            Ok(re) if re.is_match(&did.name) => {}
            _ => return false,
        }
    }

    if !filter.scope.is_empty() {
        let any_scope_matches = filter.scope.iter().any(|pattern| {
            Regex::new(pattern)
                .map(|re| re.is_match(&did.scope))
                .unwrap_or(false)
        });
        if !any_scope_matches {
            return false;
        }
    }

    for (key, matcher) in &filter.metadata {
        let Some(value) = did.metadata.get(key) else {
            return false;
        };
        let value_str = value.to_string();
        let any_pattern_matches = matcher.patterns().iter().any(|pattern| {
            Regex::new(pattern)
                .map(|re| re.is_match(&value_str))
                .unwrap_or(false)
        });
        if !any_pattern_matches {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_models::{DidType, MetadataValue};
    use std::collections::HashMap;

    fn did(scope: &str, name: &str, project: Option<&str>) -> DataIdentifier {
        let mut metadata = HashMap::new();
        if let Some(project) = project {
            metadata.insert("project".to_string(), MetadataValue::String(project.to_string()));
        }
        DataIdentifier {
            scope: scope.to_string(),
            name: name.to_string(),
            did_type: DidType::Dataset,
            hidden: false,
            metadata,
        }
    }

    #[test]
    fn name_pattern_and_metadata_match_together() {
        let mut filter = Filter {
            pattern: Some(r"^mc16\..*".to_string()),
            scope: vec![],
            split_rule: true,
            metadata: HashMap::new(),
        };
        filter
            .metadata
            .insert("project".to_string(), MetadataMatcher::One("mc16".to_string()));
        let d = did("data16", "mc16.dataset001", Some("mc16"));
        assert!(is_matching(&filter, &d));
    }

    #[test]
    fn scope_regex_matching_none_of_the_dids_scope_fails() {
        let filter = Filter {
            pattern: None,
            scope: vec!["^nonexistent$".to_string()],
            split_rule: false,
            metadata: HashMap::new(),
        };
        let d = did("data16", "mc16.dataset001", None);
        assert!(!is_matching(&filter, &d));
    }

    #[test]
    fn unknown_metadata_key_with_no_did_entry_fails_match() {
        let mut filter = Filter {
            pattern: None,
            scope: vec![],
            split_rule: false,
            metadata: HashMap::new(),
        };
        filter
            .metadata
            .insert("absent_key".to_string(), MetadataMatcher::One(".*".to_string()));
        let d = did("data16", "mc16.dataset001", None);
        assert!(!is_matching(&filter, &d));
    }
}
