//! Pattern matching over message text.
//!
//! Two checks, both pure:
//! - the required link pattern must be present (case-insensitive)
//! - none of the excluded keyword patterns may be present
//!
//! Exclusion wins: a message with the link and an excluded keyword is
//! rejected as `ExcludedKeyword`.

use regex::{Regex, RegexBuilder};
use tracing::debug;

use crate::error::ConfigError;
use crate::pipeline::types::DropReason;

/// Prefix marking a configured pattern as a raw regex rather than a literal.
pub const REGEX_PREFIX: &str = "re:";

/// How excluded keywords are matched against text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeywordMatch {
    /// Match case exactly. Off by default.
    pub case_sensitive: bool,
    /// Only match whole words (`\b` boundaries). Off by default.
    pub whole_word: bool,
}

/// A single exclusion rule with its compiled regex.
#[derive(Debug, Clone)]
pub struct ExclusionRule {
    /// The keyword as configured.
    pub pattern: String,
    regex: Regex,
}

impl ExclusionRule {
    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Compiled link and keyword patterns. Read-only after construction.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    required_link: Regex,
    exclusions: Vec<ExclusionRule>,
}

impl PatternMatcher {
    /// Compile the matcher.
    ///
    /// `required_link` and each keyword are literals unless prefixed with
    /// `re:`. Blank keywords are ignored.
    pub fn new(
        required_link: &str,
        excluded_keywords: &[String],
        keyword_match: KeywordMatch,
    ) -> Result<Self, ConfigError> {
        let link_source = pattern_source(required_link.trim());
        if link_source.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_REQUIRED_LINK".into(),
                message: "required link pattern must not be empty".into(),
            });
        }
        let required_link = compile(&link_source, required_link, true)?;

        let exclusions = excluded_keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .map(|keyword| {
                let mut source = pattern_source(keyword);
                if keyword_match.whole_word {
                    source = format!(r"\b(?:{source})\b");
                }
                let regex = compile(&source, keyword, !keyword_match.case_sensitive)?;
                Ok(ExclusionRule {
                    pattern: keyword.to_string(),
                    regex,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Self {
            required_link,
            exclusions,
        })
    }

    /// True iff the text carries the required link and no excluded keyword.
    pub fn is_admissible(&self, text: &str) -> bool {
        self.check(text).is_ok()
    }

    /// Same as [`is_admissible`](Self::is_admissible) but reports why a
    /// text is rejected.
    pub fn check(&self, text: &str) -> Result<(), DropReason> {
        if text.trim().is_empty() || !self.has_required_link(text) {
            return Err(DropReason::NoLinkPattern);
        }

        if let Some(rule) = self.matching_exclusion(text) {
            debug!(keyword = %rule.pattern, "Text matched excluded keyword");
            return Err(DropReason::ExcludedKeyword);
        }

        Ok(())
    }

    pub fn has_required_link(&self, text: &str) -> bool {
        self.required_link.is_match(text)
    }

    /// First exclusion rule matching the text, if any.
    pub fn matching_exclusion(&self, text: &str) -> Option<&ExclusionRule> {
        self.exclusions.iter().find(|r| r.is_match(text))
    }

    pub fn exclusion_count(&self) -> usize {
        self.exclusions.len()
    }
}

/// Regex source for a configured pattern: `re:` patterns verbatim,
/// everything else escaped as a literal.
fn pattern_source(configured: &str) -> String {
    match configured.strip_prefix(REGEX_PREFIX) {
        Some(raw) => raw.to_string(),
        None => regex::escape(configured),
    }
}

fn compile(source: &str, configured: &str, case_insensitive: bool) -> Result<Regex, ConfigError> {
    RegexBuilder::new(source)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| ConfigError::InvalidPattern {
            pattern: configured.to_string(),
            source: e,
        })
}
