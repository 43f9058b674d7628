//! Recognizes script commands that fan out to other scripts.
//!
//! Two forms produce children: `npm run <script>` with no trailing
//! arguments, and `concurrently` invocations whose arguments are `npm:<pat>`
//! references (a trailing `*` in the pattern matches declared script names
//! by prefix). Anything else is opaque and runs as a plain command.

/// Returns the script names the command of `script_name` delegates to,
/// resolved against the package's declared scripts. Sorted and deduplicated.
/// A pattern matching zero scripts contributes nothing; overall validity is
/// enforced when the task graph is assembled.
pub fn parse_children<'a>(
    script_name: &str,
    command: &str,
    script_names: impl Iterator<Item = &'a str> + Clone,
) -> Vec<String> {
    let tokens = tokenize(command);
    let mut children = match tokens.split_first() {
        Some((first, rest)) if first == "npm" => parse_npm_run(rest),
        Some((first, rest)) if first == "concurrently" => {
            parse_concurrently(script_name, rest, script_names)
        }
        _ => Vec::new(),
    };
    children.sort();
    children.dedup();
    children
}

fn parse_npm_run(args: &[String]) -> Vec<String> {
    // Exactly `npm run <script>`; trailing arguments make the command
    // opaque because they change the child's behavior.
    match args {
        [run, script] if run == "run" => vec![script.clone()],
        _ => Vec::new(),
    }
}

fn parse_concurrently<'a>(
    script_name: &str,
    args: &[String],
    script_names: impl Iterator<Item = &'a str> + Clone,
) -> Vec<String> {
    let mut children = Vec::new();
    for arg in args {
        // Flags configure concurrently itself, not children.
        if arg.starts_with('-') {
            continue;
        }
        let Some(pattern) = arg.strip_prefix("npm:") else {
            continue;
        };
        match pattern.strip_suffix('*') {
            Some(prefix) => {
                for name in script_names.clone() {
                    // A wildcard from the wrapping script must not match the
                    // wrapper itself.
                    if name.starts_with(prefix) && name != script_name {
                        children.push(name.to_string());
                    }
                }
            }
            None => children.push(pattern.to_string()),
        }
    }
    children
}

/// Splits a command string on whitespace, honoring single and double quotes.
fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match (c, quote) {
            (c, Some(q)) if c == q => quote = None,
            ('"', None) | ('\'', None) => quote = Some(c),
            (c, None) if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            (c, _) => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    const SCRIPTS: &[&str] = &["build", "build:esm", "build:cjs", "test", "lint"];

    fn children(command: &str) -> Vec<String> {
        parse_children("build", command, SCRIPTS.iter().copied())
    }

    #[test_case("npm run build", &["build"] ; "npm run")]
    #[test_case("npm run build -- --watch", &[] ; "npm run with args")]
    #[test_case("npm build", &[] ; "npm without run")]
    #[test_case("tsc -p .", &[] ; "plain command")]
    #[test_case("concurrently \"npm:build:*\"", &["build:cjs", "build:esm"] ; "wildcard")]
    #[test_case("concurrently 'npm:lint' 'npm:test'", &["lint", "test"] ; "explicit list")]
    #[test_case("concurrently --kill-others \"npm:build:*\"", &["build:cjs", "build:esm"] ; "flags skipped")]
    #[test_case("concurrently \"npm:nomatch:*\"", &[] ; "zero matches allowed")]
    fn test_parse_children(command: &str, expected: &[&str]) {
        assert_eq!(children(command), expected);
    }

    #[test]
    fn test_wildcard_does_not_match_self() {
        // `npm:build*` from the `build` script must not include `build`
        // itself even though the prefix matches.
        let result =
            parse_children("build", "concurrently \"npm:build*\"", SCRIPTS.iter().copied());
        assert_eq!(result, vec!["build:cjs", "build:esm"]);
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize("concurrently \"npm:a b\" 'npm:c'"),
            vec!["concurrently", "npm:a b", "npm:c"]
        );
    }
}
