//! Build-wide test policy and the `--testcmd` wrapper template.

use crate::error::TestError;

/// A validated `--testcmd` template.
///
/// The template holds exactly one `%s` slot which receives the test's
/// program (the first invocation element). `%%` is a literal percent sign.
/// Any other `%` directive is rejected at parse time so that a bad template
/// fails before the first test runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    raw: String,
}

impl CommandTemplate {
    /// The substitution slot.
    pub const SLOT: &'static str = "%s";

    /// Parse and validate a template string.
    pub fn parse(template: &str) -> Result<Self, TestError> {
        let invalid = |reason: String| TestError::Configuration {
            template: template.to_string(),
            reason,
        };

        let mut slots = 0usize;
        let mut chars = template.chars();
        while let Some(ch) = chars.next() {
            if ch != '%' {
                continue;
            }
            match chars.next() {
                Some('s') => slots += 1,
                Some('%') => {}
                Some(other) => {
                    return Err(invalid(format!("unsupported directive '%{other}'")));
                }
                None => return Err(invalid("trailing '%'".into())),
            }
        }

        match slots {
            1 => {}
            0 => return Err(invalid("no '%s' slot for the test program".into())),
            n => return Err(invalid(format!("expected exactly one '%s' slot, found {n}"))),
        }

        Ok(Self {
            raw: template.to_string(),
        })
    }

    /// The template as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Substitute `program` into the slot and split the result on whitespace.
    pub fn apply(&self, program: &str) -> Vec<String> {
        let mut expanded = String::with_capacity(self.raw.len() + program.len());
        let mut chars = self.raw.chars();
        while let Some(ch) = chars.next() {
            if ch != '%' {
                expanded.push(ch);
                continue;
            }
            match chars.next() {
                Some('s') => expanded.push_str(program),
                Some('%') => expanded.push('%'),
                // Unreachable for a parsed template.
                Some(other) => {
                    expanded.push('%');
                    expanded.push(other);
                }
                None => expanded.push('%'),
            }
        }
        expanded.split_whitespace().map(str::to_string).collect()
    }
}

/// Process-wide test policy, fixed before any test runs.
#[derive(Debug, Clone, Default)]
pub struct BuildPolicy {
    /// Failing tests are recorded but do not abort the build.
    pub permissive: bool,
    /// No test is executed; every test task is skipped.
    pub no_tests: bool,
    /// Optional wrapper applied to every test invocation.
    pub command_template: Option<CommandTemplate>,
}

impl BuildPolicy {
    /// Rewrite an invocation through the wrapper template, if one is set.
    ///
    /// Only the first element of `invocation` is substituted; the template
    /// result replaces the whole list.
    pub fn wrap(&self, invocation: Vec<String>) -> Vec<String> {
        match (&self.command_template, invocation.first()) {
            (Some(template), Some(program)) => template.apply(program),
            _ => invocation,
        }
    }
}
