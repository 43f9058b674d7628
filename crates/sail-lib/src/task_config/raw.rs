use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A task definition as it appears in configuration, before defaulting and
/// merging. Field names follow the configuration file's camelCase spelling.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawTaskDefinition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    // Accepted so we can reject it with a proper error: children are always
    // inferred from scripts, never configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,
}

impl RawTaskDefinition {
    /// All dependency-list tokens in declaration order.
    pub fn dependency_tokens(&self) -> impl Iterator<Item = &str> {
        self.depends_on
            .iter()
            .flatten()
            .chain(self.before.iter().flatten())
            .chain(self.after.iter().flatten())
            .map(String::as_str)
    }
}

/// The run-wide configuration document: global task definitions keyed by
/// task name. Per-package overrides use the same task definition shape and
/// live with the package.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawSailConfig {
    #[serde(default)]
    pub tasks: BTreeMap<String, RawTaskDefinition>,
}

impl RawSailConfig {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = RawSailConfig::parse(
            r#"{
                "tasks": {
                    "build": { "dependsOn": ["^build"], "outputs": ["dist/**"] },
                    "clean": { "cache": false }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.tasks.len(), 2);
        assert_eq!(
            config.tasks["build"].depends_on,
            Some(vec!["^build".to_string()])
        );
        assert_eq!(config.tasks["clean"].cache, Some(false));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = RawSailConfig::parse(r#"{ "tasks": { "build": { "bogus": 1 } } }"#);
        assert!(result.is_err());
    }
}
