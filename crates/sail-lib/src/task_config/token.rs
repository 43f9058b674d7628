//! The symbolic dependency token grammar.
//!
//! - `name` — the task of that name in the same package
//! - `^name` — the task of that name in each package this package depends on
//! - `pkg#name` — a specific task in a specific package
//! - `*` — every other task in the same package (before/after only)
//! - `^*` — every task in the packages this package depends on
//!   (before/after only)
//! - `...` — splice point for the global definition's list (overrides only)

use sail_task_id::TaskId;

pub const ALL_SIBLINGS: &str = "*";
pub const ALL_UPSTREAM: &str = "^*";
pub const UPSTREAM_PREFIX: char = '^';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyToken {
    /// `name`
    Sibling(String),
    /// `^name`
    Upstream(String),
    /// `pkg#name`
    Package(TaskId<'static>),
    /// `*`
    AllSiblings,
    /// `^*`
    AllUpstream,
    /// `...`
    Ellipsis,
}

/// Parses a single dependency token. Returns `None` for malformed tokens;
/// tokens are case-sensitive.
pub fn parse(token: &str) -> Option<DependencyToken> {
    match token {
        "" => None,
        super::ELLIPSIS_TOKEN => Some(DependencyToken::Ellipsis),
        ALL_SIBLINGS => Some(DependencyToken::AllSiblings),
        ALL_UPSTREAM => Some(DependencyToken::AllUpstream),
        _ => {
            if let Some(rest) = token.strip_prefix(UPSTREAM_PREFIX) {
                if rest.is_empty() || rest.contains('*') || rest.contains('#') {
                    return None;
                }
                return Some(DependencyToken::Upstream(rest.to_string()));
            }
            if token.contains('#') {
                let task_id = TaskId::try_from(token).ok()?;
                return Some(DependencyToken::Package(task_id.into_owned()));
            }
            if token.contains('*') {
                return None;
            }
            Some(DependencyToken::Sibling(token.to_string()))
        }
    }
}

pub fn is_package_qualified(token: &str) -> bool {
    matches!(parse(token), Some(DependencyToken::Package(_)))
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case("build", Some(DependencyToken::Sibling("build".into())) ; "sibling")]
    #[test_case("^build", Some(DependencyToken::Upstream("build".into())) ; "upstream")]
    #[test_case("*", Some(DependencyToken::AllSiblings) ; "all siblings")]
    #[test_case("^*", Some(DependencyToken::AllUpstream) ; "all upstream")]
    #[test_case("...", Some(DependencyToken::Ellipsis) ; "ellipsis")]
    #[test_case("", None ; "empty")]
    #[test_case("^", None ; "bare caret")]
    #[test_case("^pkg#task", None ; "caret with package")]
    #[test_case("bui*ld", None ; "stray wildcard")]
    fn test_parse(token: &str, expected: Option<DependencyToken>) {
        assert_eq!(parse(token), expected);
    }

    #[test]
    fn test_parse_package_qualified() {
        assert_eq!(
            parse("web#build"),
            Some(DependencyToken::Package(TaskId::new("web", "build").into_owned()))
        );
        assert!(is_package_qualified("web#build"));
        assert!(!is_package_qualified("build"));
    }

    #[test]
    fn test_case_sensitive() {
        // `Build` and `build` are distinct tokens.
        assert_eq!(parse("Build"), Some(DependencyToken::Sibling("Build".into())));
    }
}
