use maxx_common::Dialect;
use maxx_storage::{MappingScope, ModelMappingRow, RouteRow, StorageSnapshot};

/// Enabled routes for (dialect, project), lowest position first.
///
/// A project only owns a dialect it lists in `enabled_dialects`; everything
/// else falls through to the global bucket.
pub fn candidate_routes(
    snapshot: &StorageSnapshot,
    dialect: Dialect,
    project_id: Option<i64>,
) -> Vec<RouteRow> {
    let scope_project = project_id
        .filter(|id| *id != 0)
        .filter(|id| {
            snapshot
                .projects
                .iter()
                .any(|p| p.id == *id && p.enabled_dialects.contains(&dialect))
        })
        .unwrap_or(0);

    let mut routes: Vec<RouteRow> = snapshot
        .routes
        .iter()
        .filter(|route| {
            route.enabled && route.dialect == dialect && route.project_id == scope_project
        })
        .filter(|route| {
            snapshot
                .providers
                .iter()
                .any(|p| p.id == route.provider_id && p.enabled && p.deleted_at.is_none())
        })
        .cloned()
        .collect();
    routes.sort_by_key(|route| route.position);
    routes
}

/// Cooling routes drop to the tail but stay available as a last resort.
pub fn defer_cooling_routes(routes: Vec<RouteRow>, cooling: &[i64]) -> Vec<RouteRow> {
    let (hot, cold): (Vec<RouteRow>, Vec<RouteRow>) = routes
        .into_iter()
        .partition(|route| !cooling.contains(&route.provider_id));
    hot.into_iter().chain(cold).collect()
}

/// First matching rule wins; pass-through when none fires. Rules must
/// already be ordered by (priority, id).
pub fn map_model(request_model: &str, rules: &[ModelMappingRow], scope: &MappingScope) -> String {
    for rule in rules {
        if !rule.enabled || !rule.matches_scope(scope) {
            continue;
        }
        if wildcard_match(&rule.pattern, request_model) {
            return rule.target.clone();
        }
    }
    request_model.to_string()
}

/// `*` matches any character run. Fragments must occur in order; the first
/// is anchored to the start and the last to the end unless the pattern
/// opens or closes with `*`.
pub fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }

    let fragments: Vec<&str> = pattern.split('*').collect();
    let anchored_start = !pattern.starts_with('*');
    let anchored_end = !pattern.ends_with('*');
    let last = fragments.len() - 1;
    let mut pos = 0usize;

    for (index, fragment) in fragments.iter().enumerate() {
        if fragment.is_empty() {
            continue;
        }
        if index == 0 && anchored_start {
            if !value.starts_with(fragment) {
                return false;
            }
            pos = fragment.len();
            continue;
        }
        if index == last && anchored_end {
            let rest = &value[pos..];
            return rest.len() >= fragment.len() && rest.ends_with(fragment);
        }
        match value[pos..].find(fragment) {
            Some(found) => pos += found + fragment.len(),
            None => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use maxx_common::ProviderKind;
    use maxx_storage::{ProjectRow, ProviderRow};
    use time::OffsetDateTime;

    fn provider(id: i64) -> ProviderRow {
        let now = OffsetDateTime::now_utc();
        ProviderRow {
            id,
            name: format!("provider-{id}"),
            kind: ProviderKind::Custom,
            config_json: serde_json::json!({}),
            enabled: true,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn route(id: i64, project_id: i64, provider_id: i64, position: i32) -> RouteRow {
        RouteRow {
            id,
            project_id,
            dialect: Dialect::Claude,
            provider_id,
            position,
            enabled: true,
            native: false,
            retry_config_id: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    fn snapshot() -> StorageSnapshot {
        let now = OffsetDateTime::now_utc();
        StorageSnapshot {
            providers: vec![provider(10), provider(11)],
            routes: vec![
                route(1, 0, 10, 2),
                route(2, 0, 11, 1),
                route(3, 7, 10, 1),
            ],
            projects: vec![ProjectRow {
                id: 7,
                name: "demo".to_string(),
                slug: "demo".to_string(),
                enabled_dialects: vec![Dialect::Claude],
                created_at: now,
                updated_at: now,
            }],
            retry_configs: Vec::new(),
            model_mappings: Vec::new(),
            api_tokens: Vec::new(),
            settings: Vec::new(),
        }
    }

    #[test]
    fn global_routes_ordered_by_position() {
        let routes = candidate_routes(&snapshot(), Dialect::Claude, None);
        assert_eq!(routes.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn project_scope_used_when_dialect_enabled() {
        let routes = candidate_routes(&snapshot(), Dialect::Claude, Some(7));
        assert_eq!(routes.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn project_without_dialect_falls_through_to_global() {
        let mut snap = snapshot();
        snap.projects[0].enabled_dialects = vec![Dialect::Gemini];
        let routes = candidate_routes(&snap, Dialect::Claude, Some(7));
        assert_eq!(routes.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn cooling_providers_deferred_not_dropped() {
        let routes = candidate_routes(&snapshot(), Dialect::Claude, None);
        let ordered = defer_cooling_routes(routes, &[11]);
        assert_eq!(ordered.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn wildcard_star_matches_everything() {
        for value in ["", "a", "claude-sonnet-4-5"] {
            assert!(wildcard_match("*", value));
        }
    }

    #[test]
    fn wildcard_anchoring() {
        assert!(wildcard_match("a*b", "ab"));
        assert!(wildcard_match("a*b", "aXXb"));
        assert!(!wildcard_match("a*b", "Xab"));
        assert!(!wildcard_match("a*b", "abX"));
        assert!(!wildcard_match("a*b", "a"));
        assert!(wildcard_match("claude-*", "claude-sonnet-4-5"));
        assert!(wildcard_match("*-thinking", "gemini-3-pro-thinking"));
        assert!(wildcard_match("*opus*", "claude-opus-4-5"));
        assert!(!wildcard_match("claude-*", "gemini-2.5-pro"));
    }

    #[test]
    fn wildcard_fragments_in_order() {
        assert!(wildcard_match("a*b*c", "a1b2c"));
        assert!(!wildcard_match("a*b*c", "a1c2b"));
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            ModelMappingRow {
                id: 1,
                priority: 0,
                pattern: "claude-*".to_string(),
                target: "gemini-3-pro".to_string(),
                dialect: None,
                provider_id: None,
                project_id: None,
                route_id: None,
                token_id: None,
                enabled: true,
            },
            ModelMappingRow {
                id: 2,
                priority: 1,
                pattern: "*".to_string(),
                target: "fallback".to_string(),
                dialect: None,
                provider_id: None,
                project_id: None,
                route_id: None,
                token_id: None,
                enabled: true,
            },
        ];
        let scope = MappingScope::default();
        assert_eq!(
            map_model("claude-sonnet-4-5", &rules, &scope),
            "gemini-3-pro"
        );
        assert_eq!(map_model("gpt-4o", &rules, &scope), "fallback");
    }

    #[test]
    fn unmatched_model_passes_through() {
        let scope = MappingScope::default();
        assert_eq!(map_model("gpt-4o", &[], &scope), "gpt-4o");
    }

    #[test]
    fn scoped_rule_skipped_for_other_project() {
        let rules = vec![ModelMappingRow {
            id: 1,
            priority: 0,
            pattern: "*".to_string(),
            target: "scoped".to_string(),
            dialect: None,
            provider_id: None,
            project_id: Some(7),
            route_id: None,
            token_id: None,
            enabled: true,
        }];
        let other = MappingScope {
            project_id: Some(9),
            ..Default::default()
        };
        assert_eq!(map_model("m", &rules, &other), "m");
        let same = MappingScope {
            project_id: Some(7),
            ..Default::default()
        };
        assert_eq!(map_model("m", &rules, &same), "scoped");
    }
}
