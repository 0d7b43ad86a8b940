//! Activity-field schema validation (§4.6 step 6). `locked`/`purge_replicas`
//! loose-typing normalization happens earlier, at the `RuleTemplate`
//! deserialization boundary in `grid_models::rule`.

/// `activity` is validated against a small fixed vocabulary; anything else
/// is coerced to `"default"` rather than rejected.
const KNOWN_ACTIVITIES: &[&str] = &[
    "default",
    "User Subscriptions",
    "Data Brokering",
    "Data Consolidation",
    "Analysis Output",
    "Production Output",
];

pub fn normalize_activity(activity: Option<&str>) -> String {
    match activity {
        Some(a) if KNOWN_ACTIVITIES.contains(&a) => a.to_string(),
        _ => "default".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_activity_is_replaced_with_default() {
        assert_eq!(normalize_activity(Some("Not A Real Activity")), "default");
    }

    #[test]
    fn known_activity_passes_through() {
        assert_eq!(normalize_activity(Some("Data Brokering")), "Data Brokering");
    }

    #[test]
    fn missing_activity_is_default() {
        assert_eq!(normalize_activity(None), "default");
    }
}
