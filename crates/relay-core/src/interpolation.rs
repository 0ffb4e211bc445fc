//! Variable interpolation.
//!
//! Supports the `${{ name }}` syntax. Resolution is explicit: a
//! [`VariableScope`] is built from the pipeline/stage/job layers plus
//! caller overrides, and the ambient process environment is consulted only
//! for names on the pass-through whitelist.

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

fn expr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{\{\s*([^}]*?)\s*\}\}").unwrap())
}

/// What to do when an expression references a key with no binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingVarPolicy {
    /// Resolve to the empty string and log a warning.
    #[default]
    Warn,
    /// Fail the job with [`Error::Variable`].
    Fail,
}

/// Fully-resolved variable bindings for one job.
#[derive(Debug, Clone, Default)]
pub struct VariableScope {
    bindings: HashMap<String, String>,
}

impl VariableScope {
    /// Layer bindings in increasing precedence: pipeline, stage, job,
    /// caller overrides. Pass-through names are copied from the process
    /// environment at the lowest precedence.
    pub fn build(
        layers: &[&HashMap<String, String>],
        overrides: &HashMap<String, String>,
        pass_env: &[String],
    ) -> Self {
        let mut bindings = HashMap::new();
        for name in pass_env {
            if let Ok(value) = std::env::var(name) {
                bindings.insert(name.clone(), value);
            }
        }
        for layer in layers {
            bindings.extend((*layer).iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        bindings.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { bindings }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.bindings.get(name).map(String::as_str)
    }

    /// Expand every `${{ name }}` expression in `input`.
    ///
    /// `job` is only used for diagnostics. Under [`MissingVarPolicy::Warn`]
    /// a missing key expands to the empty string.
    pub fn interpolate(&self, job: &str, input: &str, policy: MissingVarPolicy) -> Result<String> {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in expr_regex().captures_iter(input) {
            let whole = caps.get(0).unwrap();
            let name = caps.get(1).unwrap().as_str();
            out.push_str(&input[last..whole.start()]);
            match self.bindings.get(name) {
                Some(value) => out.push_str(value),
                None => match policy {
                    MissingVarPolicy::Warn => {
                        warn!(job, variable = name, "unresolved variable, expanding to empty");
                    }
                    MissingVarPolicy::Fail => {
                        return Err(Error::Variable {
                            job: job.to_string(),
                            name: name.to_string(),
                        });
                    }
                },
            }
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    /// Expand every value of a map, keeping keys as-is.
    pub fn interpolate_map(
        &self,
        job: &str,
        map: &HashMap<String, String>,
        policy: MissingVarPolicy,
    ) -> Result<HashMap<String, String>> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.interpolate(job, v, policy)?)))
            .collect()
    }

    pub fn into_bindings(self) -> HashMap<String, String> {
        self.bindings
    }
}

/// Reject text containing an unterminated `${{` opener.
///
/// Called at load time so malformed syntax is a validation error rather
/// than a surprise mid-run.
pub fn check_syntax(input: &str) -> std::result::Result<(), String> {
    let mut rest = input;
    while let Some(pos) = rest.find("${{") {
        let after = &rest[pos + 3..];
        match after.find("}}") {
            Some(close) => rest = &after[close + 2..],
            None => {
                return Err(format!(
                    "unterminated interpolation expression in {input:?}"
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scope(pairs: &[(&str, &str)]) -> VariableScope {
        let layer: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        VariableScope::build(&[&layer], &HashMap::new(), &[])
    }

    #[test]
    fn interpolates_simple_variable() {
        let s = scope(&[("NAME", "world")]);
        assert_eq!(
            s.interpolate("j", "Hello ${{ NAME }}!", MissingVarPolicy::Warn)
                .unwrap(),
            "Hello world!"
        );
    }

    #[test]
    fn interpolates_with_whitespace_variations() {
        let s = scope(&[("VAR", "value")]);
        for input in ["${{VAR}}", "${{ VAR }}", "${{  VAR  }}"] {
            assert_eq!(
                s.interpolate("j", input, MissingVarPolicy::Warn).unwrap(),
                "value"
            );
        }
    }

    #[test]
    fn missing_variable_expands_to_empty_under_warn() {
        let s = scope(&[]);
        assert_eq!(
            s.interpolate("j", "v=${{ MISSING }}", MissingVarPolicy::Warn)
                .unwrap(),
            "v="
        );
    }

    #[test]
    fn missing_variable_fails_under_strict_policy() {
        let s = scope(&[]);
        let err = s
            .interpolate("unit", "${{ MISSING }}", MissingVarPolicy::Fail)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Variable { job, name } if job == "unit" && name == "MISSING"
        ));
    }

    #[test]
    fn overrides_win_over_layers() {
        let layer: HashMap<String, String> =
            [("A".to_string(), "layer".to_string())].into_iter().collect();
        let overrides: HashMap<String, String> =
            [("A".to_string(), "override".to_string())].into_iter().collect();
        let s = VariableScope::build(&[&layer], &overrides, &[]);
        assert_eq!(s.get("A"), Some("override"));
    }

    #[test]
    fn pass_env_is_lowest_precedence() {
        // SAFETY: test-local variable name, no concurrent reader cares.
        unsafe { std::env::set_var("RELAY_TEST_PASSTHROUGH", "ambient") };
        let layer: HashMap<String, String> =
            [("RELAY_TEST_PASSTHROUGH".to_string(), "layered".to_string())]
                .into_iter()
                .collect();

        let s = VariableScope::build(
            &[],
            &HashMap::new(),
            &["RELAY_TEST_PASSTHROUGH".to_string()],
        );
        assert_eq!(s.get("RELAY_TEST_PASSTHROUGH"), Some("ambient"));

        let s = VariableScope::build(
            &[&layer],
            &HashMap::new(),
            &["RELAY_TEST_PASSTHROUGH".to_string()],
        );
        assert_eq!(s.get("RELAY_TEST_PASSTHROUGH"), Some("layered"));
    }

    #[test]
    fn non_whitelisted_environment_is_invisible() {
        // SAFETY: test-local variable name.
        unsafe { std::env::set_var("RELAY_TEST_HIDDEN", "leak") };
        let s = VariableScope::build(&[], &HashMap::new(), &[]);
        assert_eq!(
            s.interpolate("j", "${{ RELAY_TEST_HIDDEN }}", MissingVarPolicy::Warn)
                .unwrap(),
            ""
        );
    }

    #[test]
    fn check_syntax_accepts_balanced_and_plain_text() {
        assert!(check_syntax("no expressions").is_ok());
        assert!(check_syntax("a ${{ X }} b ${{ Y }}").is_ok());
    }

    #[test]
    fn check_syntax_rejects_unterminated_opener() {
        assert!(check_syntax("echo ${{ OOPS").is_err());
        assert!(check_syntax("${{ A }} then ${{ B").is_err());
    }
}
