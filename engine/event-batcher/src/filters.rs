//! Filter definitions and matching against submitted filters

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One (category, option) partition of a metric, backed by a sub-metric row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDefinition {
    pub category: String,
    pub name: String,
}

/// Filter definitions keyed by the id of the sub-metric they update
pub type FilterDefinitions = HashMap<Uuid, FilterDefinition>;

/// Decode the filter blob stored on a metric row.
///
/// An empty blob or JSON `null` means the metric has no filters.
pub fn decode_filter_definitions(blob: &str) -> Result<FilterDefinitions, serde_json::Error> {
    let trimmed = blob.trim();
    if trimmed.is_empty() {
        return Ok(HashMap::new());
    }

    let decoded: Option<FilterDefinitions> = serde_json::from_str(trimmed)?;
    Ok(decoded.unwrap_or_default())
}

/// Encode filter definitions the way they are stored on a metric row
pub fn encode_filter_definitions(
    definitions: &FilterDefinitions,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(definitions)
}

/// Ids of every definition whose category and option both equal a submitted pair.
///
/// Sorted so that sub-metric rows are always touched in the same order.
pub fn matching_filters(
    definitions: &FilterDefinitions,
    submitted: &HashMap<String, String>,
) -> Vec<Uuid> {
    if submitted.is_empty() {
        return Vec::new();
    }

    let mut hits: Vec<Uuid> = definitions
        .iter()
        .filter(|(_, definition)| {
            submitted.get(&definition.category).is_some_and(|name| *name == definition.name)
        })
        .map(|(id, _)| *id)
        .collect();
    hits.sort_unstable();
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definitions() -> (FilterDefinitions, Uuid, Uuid, Uuid) {
        let pro = Uuid::new_v4();
        let starter = Uuid::new_v4();
        let eu = Uuid::new_v4();
        let mut defs = HashMap::new();
        defs.insert(pro, FilterDefinition { category: "plan".into(), name: "pro".into() });
        defs.insert(starter, FilterDefinition { category: "plan".into(), name: "starter".into() });
        defs.insert(eu, FilterDefinition { category: "region".into(), name: "eu".into() });
        (defs, pro, starter, eu)
    }

    #[test]
    fn test_single_category_match() {
        let (defs, pro, _, _) = definitions();
        let submitted = HashMap::from([("plan".to_string(), "pro".to_string())]);
        assert_eq!(matching_filters(&defs, &submitted), vec![pro]);
    }

    #[test]
    fn test_multiple_categories_all_hit() {
        let (defs, pro, _, eu) = definitions();
        let submitted = HashMap::from([
            ("plan".to_string(), "pro".to_string()),
            ("region".to_string(), "eu".to_string()),
        ]);
        let mut expected = vec![pro, eu];
        expected.sort_unstable();
        assert_eq!(matching_filters(&defs, &submitted), expected);
    }

    #[test]
    fn test_equality_is_exact() {
        let (defs, _, _, _) = definitions();
        let submitted = HashMap::from([
            ("plan".to_string(), "Pro".to_string()),
            ("Region".to_string(), "eu".to_string()),
            ("tier".to_string(), "pro".to_string()),
        ]);
        assert!(matching_filters(&defs, &submitted).is_empty());
    }

    #[test]
    fn test_decode_blob() {
        let (defs, pro, _, _) = definitions();
        let blob = encode_filter_definitions(&defs).unwrap();
        let decoded = decode_filter_definitions(&blob).unwrap();
        assert_eq!(decoded.get(&pro).map(|d| d.name.as_str()), Some("pro"));

        assert!(decode_filter_definitions("").unwrap().is_empty());
        assert!(decode_filter_definitions("null").unwrap().is_empty());
        assert!(decode_filter_definitions("{}").unwrap().is_empty());
        assert!(decode_filter_definitions("{\"not-a-uuid\": 3}").is_err());
        assert!(decode_filter_definitions("[1, 2").is_err());
    }
}
