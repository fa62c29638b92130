//! Prompt rules: a regex to watch for and the literal answer to send.

use regex::bytes::Regex;
use serde::Serialize;

use super::buffer::PatternBuffer;
use crate::error::ConfigError;

/// One interactive prompt and the answer it gets.
///
/// Rules are stateless and can be shared across devices. The answer is
/// sent exactly as given, so it carries its own line terminator
/// (for example `"yes\r"`).
#[derive(Debug, Clone)]
pub struct PromptRule {
    /// Pattern matched against newly arrived output.
    pub pattern: Regex,

    /// Literal text sent when the pattern matches.
    pub answer: String,

    /// Whether the answer should be masked in logs and results.
    pub hidden: bool,
}

impl PromptRule {
    /// Create a new rule, returning an error if the pattern is invalid.
    pub fn new(pattern: &str, answer: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            answer: answer.into(),
            hidden: false,
        })
    }

    /// Create a rule whose answer (a password, say) is never logged.
    pub fn hidden(pattern: &str, answer: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            hidden: true,
            ..Self::new(pattern, answer)?
        })
    }

    /// The answer as it may appear in logs and results.
    pub fn display_answer(&self) -> &str {
        if self.hidden { "********" } else { &self.answer }
    }
}

impl Serialize for PromptRule {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (self.pattern.as_str(), self.display_answer()).serialize(serializer)
    }
}

/// Ordered rule list; the first rule in list order wins.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct PromptRules {
    rules: Vec<PromptRule>,
}

/// A rule that matched the unconsumed output.
#[derive(Debug)]
pub struct RuleMatch<'a> {
    /// Position of the rule in the list.
    pub index: usize,

    /// The rule itself.
    pub rule: &'a PromptRule,

    /// The matched text.
    pub matched: String,
}

impl PromptRules {
    /// Create a rule list.
    pub fn new(rules: Vec<PromptRule>) -> Self {
        Self { rules }
    }

    /// Build rules from parallel prompt and answer lists.
    pub fn from_pairs(prompts: &[String], answers: &[String]) -> Result<Self, ConfigError> {
        if prompts.len() != answers.len() {
            return Err(ConfigError::PromptAnswerMismatch {
                prompts: prompts.len(),
                answers: answers.len(),
            });
        }

        let rules = prompts
            .iter()
            .zip(answers)
            .map(|(prompt, answer)| {
                PromptRule::new(prompt, answer.clone()).map_err(|e| ConfigError::Invalid {
                    name: "prompts",
                    message: format!("{prompt:?}: {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { rules })
    }

    /// Whether no rules are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Iterate the rules in order.
    pub fn iter(&self) -> impl Iterator<Item = &PromptRule> {
        self.rules.iter()
    }

    /// Find the first rule, in list order, matching the unconsumed output.
    ///
    /// Rules whose index is set in `skip` are not evaluated; the matcher
    /// uses this so each rule fires at most once per scan cycle. On a hit the
    /// matched region is consumed.
    pub fn scan(&self, buffer: &mut PatternBuffer, skip: &[bool]) -> Option<RuleMatch<'_>> {
        let (index, rule, end, matched) =
            self.rules.iter().enumerate().find_map(|(index, rule)| {
                if skip.get(index).copied().unwrap_or(false) {
                    return None;
                }
                buffer.search_unconsumed(&rule.pattern).map(|m| {
                    let matched = String::from_utf8_lossy(m.as_bytes()).into_owned();
                    (index, rule, m.end(), matched)
                })
            })?;

        buffer.consume(end);
        Some(RuleMatch {
            index,
            rule,
            matched,
        })
    }
}

impl From<Vec<PromptRule>> for PromptRules {
    fn from(rules: Vec<PromptRule>) -> Self {
        Self::new(rules)
    }
}

/// Default completion pattern: a typical CLI prompt at the end of output.
pub const DEFAULT_PROMPT_PATTERN: &str = r"[>#$]\s*$";

/// Compile a device prompt pattern, anchoring it to the end of output if
/// no anchor is given.
pub fn compile_prompt_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let pattern = if pattern.ends_with('$') {
        pattern.to_string()
    } else {
        format!("{}\\s*$", pattern)
    };

    Regex::new(&pattern)
}
