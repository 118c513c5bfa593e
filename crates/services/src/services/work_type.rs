/// Work type classification for tasks.
///
/// Explicit types always win; this heuristic only runs when a task is created
/// without one. Returning None leaves the task unclassified so an agent or
/// user can label it later.

pub const VALID_WORK_TYPES: &[&str] = &[
    "feature",
    "bugfix",
    "test",
    "refactor",
    "docs",
    "infrastructure",
    "design",
];

pub fn is_valid_work_type(work_type: &str) -> bool {
    VALID_WORK_TYPES.contains(&work_type)
}

const TAG_MAPPING: &[(&str, &str)] = &[
    ("bugfix", "bugfix"),
    ("bug", "bugfix"),
    ("fix", "bugfix"),
    ("hotfix", "bugfix"),
    ("test", "test"),
    ("testing", "test"),
    ("qa", "test"),
    ("e2e", "test"),
    ("integration-test", "test"),
    ("unit-test", "test"),
    ("refactor", "refactor"),
    ("refactoring", "refactor"),
    ("cleanup", "refactor"),
    ("docs", "docs"),
    ("documentation", "docs"),
    ("readme", "docs"),
    ("infra", "infrastructure"),
    ("infrastructure", "infrastructure"),
    ("devops", "infrastructure"),
    ("ci", "infrastructure"),
    ("cd", "infrastructure"),
    ("deploy", "infrastructure"),
    ("deployment", "infrastructure"),
    ("design", "design"),
    ("ux", "design"),
    ("ui", "design"),
    ("wireframe", "design"),
    ("feature", "feature"),
];

const BUGFIX_PATTERNS: &[&str] = &[
    "fix ", "fix:", "bugfix", "bug:", "hotfix", "patch ", "resolve ", "repair ", "crash ",
    "error in", "broken ",
];

const TEST_PATTERNS: &[&str] = &[
    "add test",
    "write test",
    "integration test",
    "unit test",
    "e2e test",
    "test coverage",
    "test for ",
    "tests for ",
    "add spec",
    "test:",
    "testing ",
];

const REFACTOR_PATTERNS: &[&str] = &[
    "refactor", "cleanup", "clean up", "reorganize", "simplify", "extract ", "rename ", "move ",
];

const DOC_PATTERNS: &[&str] = &[
    "document",
    "docs:",
    "readme",
    "update docs",
    "add documentation",
    "api docs",
    "jsdoc",
    "docstring",
];

const INFRA_PATTERNS: &[&str] = &[
    "deploy",
    "ci/cd",
    "pipeline",
    "docker",
    "kubernetes",
    "terraform",
    "ansible",
    "monitoring",
    "alerting",
    "infrastructure",
    "devops",
    "nginx",
    "ssl",
];

const DESIGN_PATTERNS: &[&str] = &[
    "design ",
    "ux ",
    "ui ",
    "wireframe",
    "mockup",
    "user flow",
    "prototype",
    "design system",
];

const FEATURE_PATTERNS: &[&str] = &[
    "implement ", "add ", "create ", "build ", "develop ", "new ", "feature:", "feat:",
];

/// Infer a work type from title and tags. Tags carry the highest confidence,
/// then title patterns, checked most-specific first.
pub fn infer_work_type(title: &str, tags: &[String], _description: &str) -> Option<&'static str> {
    let title_lower = title.to_lowercase();

    for tag in tags {
        let tag_lower = tag.to_lowercase();
        if let Some((_, work_type)) = TAG_MAPPING.iter().find(|(t, _)| *t == tag_lower) {
            return Some(work_type);
        }
    }

    let title_matches = |patterns: &[&str]| patterns.iter().any(|p| title_lower.contains(p));

    if title_matches(BUGFIX_PATTERNS) {
        return Some("bugfix");
    }
    if title_matches(TEST_PATTERNS) {
        return Some("test");
    }
    if title_matches(REFACTOR_PATTERNS) {
        return Some("refactor");
    }
    if title_matches(DOC_PATTERNS) {
        return Some("docs");
    }
    if title_matches(INFRA_PATTERNS) {
        return Some("infrastructure");
    }
    if title_matches(DESIGN_PATTERNS) {
        return Some("design");
    }
    if title_matches(FEATURE_PATTERNS) {
        return Some("feature");
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn tag_inference_beats_title_patterns() {
        // Title says feature, tag says bugfix; tags win.
        assert_eq!(
            infer_work_type("Add retry logic", &tags(&["bugfix"]), ""),
            Some("bugfix")
        );
        assert_eq!(infer_work_type("anything", &tags(&["QA"]), ""), Some("test"));
        assert_eq!(
            infer_work_type("anything", &tags(&["devops"]), ""),
            Some("infrastructure")
        );
    }

    #[test]
    fn title_pattern_inference() {
        assert_eq!(infer_work_type("Fix login crash", &[], ""), Some("bugfix"));
        assert_eq!(
            infer_work_type("Write tests for auth module", &[], ""),
            Some("test")
        );
        assert_eq!(
            infer_work_type("Refactor session handling", &[], ""),
            Some("refactor")
        );
        assert_eq!(infer_work_type("Update docs: API guide", &[], ""), Some("docs"));
        assert_eq!(
            infer_work_type("Dockerize the worker", &[], ""),
            Some("infrastructure")
        );
        assert_eq!(
            infer_work_type("Wireframe onboarding screen", &[], ""),
            Some("design")
        );
        assert_eq!(
            infer_work_type("Implement OAuth login", &[], ""),
            Some("feature")
        );
    }

    #[test]
    fn unclassifiable_title_returns_none() {
        assert_eq!(infer_work_type("Misc", &[], ""), None);
        assert_eq!(infer_work_type("", &[], ""), None);
    }

    #[test]
    fn bugfix_checked_before_feature() {
        // "Fix " and "add " both match; bugfix has higher priority.
        assert_eq!(
            infer_work_type("Fix and add validation", &[], ""),
            Some("bugfix")
        );
    }

    #[test]
    fn valid_work_types() {
        assert!(is_valid_work_type("feature"));
        assert!(is_valid_work_type("bugfix"));
        assert!(!is_valid_work_type("chore"));
    }
}
