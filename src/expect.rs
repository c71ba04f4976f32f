//! Expected outcomes checked against captured output.

use crate::capture::CapturedOutput;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Expected outcome of a command or task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Expect {
    /// Expected exit code (default: 0 if no signal expected).
    #[serde(default)]
    pub exit: Option<i32>,

    /// Expected terminating signal (e.g. 9 for SIGKILL). Exit code is ignored when set.
    #[serde(default)]
    pub signal: Option<i32>,

    #[serde(default)]
    pub stdout: Option<OutputMatch>,

    #[serde(default)]
    pub stderr: Option<OutputMatch>,
}

/// Matching rules for stdout/stderr.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum OutputMatch {
    /// Exact string match.
    Exact(String),

    /// Structured match; every rule given must hold.
    Structured(OutputMatchStructured),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct OutputMatchStructured {
    #[serde(default)]
    pub equals: Option<String>,

    #[serde(default)]
    pub contains: Option<String>,

    #[serde(default)]
    pub regex: Option<String>,
}

impl Expect {
    /// Check `output`, returning one message per failed expectation.
    pub fn check(&self, output: &CapturedOutput) -> Vec<String> {
        let mut failures = Vec::new();

        if let Some(expected_signal) = self.signal {
            match output.signal {
                Some(actual) if actual == expected_signal => {}
                Some(actual) => {
                    failures.push(format!("signal: expected {expected_signal}, got {actual}"))
                }
                None => failures.push(format!(
                    "signal: expected {expected_signal}, but process exited with {}",
                    output.exit_status
                )),
            }
        } else {
            let expected_exit = self.exit.unwrap_or(0);
            match output.signal {
                Some(signal) => failures.push(format!(
                    "exit code: expected {expected_exit}, but process was terminated by signal {signal}"
                )),
                None if output.exit_status != expected_exit => failures.push(format!(
                    "exit code: expected {expected_exit}, got {}",
                    output.exit_status
                )),
                None => {}
            }
        }

        let streams = [
            ("stdout", &self.stdout, &output.stdout),
            ("stderr", &self.stderr, &output.stderr),
        ];
        for (stream, matcher, bytes) in streams {
            if let Some(matcher) = matcher
                && let Err(e) = matcher.check(stream, &String::from_utf8_lossy(bytes))
            {
                failures.push(e);
            }
        }

        failures
    }
}

impl OutputMatch {
    fn rules(&self) -> Vec<Rule<'_>> {
        match self {
            OutputMatch::Exact(expected) => vec![Rule::Equals(expected)],
            OutputMatch::Structured(s) => {
                let equals = s.equals.as_deref().map(Rule::Equals);
                let contains = s.contains.as_deref().map(Rule::Contains);
                let regex = s.regex.as_deref().map(Rule::Regex);
                [equals, contains, regex].into_iter().flatten().collect()
            }
        }
    }

    /// Check the contents of `stream`, reporting the first rule that fails.
    pub fn check(&self, stream: &str, actual: &str) -> Result<(), String> {
        self.rules()
            .iter()
            .try_for_each(|rule| rule.check(actual))
            .map_err(|detail| format!("{stream}: {detail}"))
    }
}

#[derive(Debug, Clone, Copy)]
enum Rule<'a> {
    Equals(&'a str),
    Contains(&'a str),
    Regex(&'a str),
}

impl Rule<'_> {
    fn check(self, actual: &str) -> Result<(), String> {
        let holds = match self {
            Rule::Equals(expected) => actual == expected,
            Rule::Contains(needle) => actual.contains(needle),
            Rule::Regex(pattern) => regex::Regex::new(pattern)
                .map_err(|e| format!("invalid regex {pattern:?}: {e}"))?
                .is_match(actual),
        };
        if holds {
            return Ok(());
        }
        Err(match self {
            Rule::Equals(expected) => {
                format!("expected exact match\n  expected: {expected:?}\n  got: {actual:?}")
            }
            Rule::Contains(needle) => format!("expected to contain {needle:?}\n  got: {actual:?}"),
            Rule::Regex(pattern) => {
                format!("expected to match regex {pattern:?}\n  got: {actual:?}")
            }
        })
    }
}
