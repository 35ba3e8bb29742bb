//! Label matchers and line filters.
//!
//! The query engine hands the store an already-parsed [`Selector`]: a set of
//! label [`Matcher`]s that pick streams, plus [`LineFilter`]s that pick
//! entries within those streams. This module only evaluates them.
//!
//! # Indexable matchers
//!
//! The inverted index only knows label values that are present on some
//! stream. A matcher that accepts the empty string (`foo=""`, `foo!="bar"`,
//! `foo=~".*"`) also matches streams that lack `foo` entirely, which the
//! index cannot enumerate. [`split_filters_and_matchers`] moves such
//! matchers out of the index lookup; they are re-checked against each
//! candidate's full label set instead.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::labels::Labels;

/// How a [`Matcher`] compares a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchType {
    /// `name="value"`
    Equal,
    /// `name!="value"`
    NotEqual,
    /// `name=~"regex"`, fully anchored.
    Regex,
    /// `name!~"regex"`, fully anchored.
    NotRegex,
}

impl MatchType {
    fn operator(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        }
    }
}

/// A predicate over one label's value.
///
/// # Examples
///
/// ```rust
/// use rivulet::matcher::{Matcher, MatchType};
///
/// let m = Matcher::new(MatchType::Regex, "job", "api|web")?;
/// assert!(m.matches("api"));
/// assert!(!m.matches("api-canary")); // regexes are anchored
///
/// let parsed: Matcher = r#"env!="dev""#.parse()?;
/// assert_eq!(parsed.kind(), MatchType::NotEqual);
/// assert_eq!(parsed.value(), "dev");
/// # Ok::<(), rivulet::error::QueryError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Matcher {
    name: String,
    kind: MatchType,
    value: String,
    re: Option<Regex>,
}

impl Matcher {
    /// Creates a matcher.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidRegex`] if `kind` is a regex type and
    /// `value` does not compile.
    pub fn new(
        kind: MatchType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, QueryError> {
        let value = value.into();
        let re = match kind {
            MatchType::Regex | MatchType::NotRegex => Some(
                Regex::new(&format!("^(?:{value})$")).map_err(|source| {
                    QueryError::InvalidRegex {
                        pattern: value.clone(),
                        source,
                    }
                })?,
            ),
            MatchType::Equal | MatchType::NotEqual => None,
        };
        Ok(Self {
            name: name.into(),
            kind,
            value,
            re,
        })
    }

    /// Creates an equality matcher. Never fails.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MatchType::Equal,
            value: value.into(),
            re: None,
        }
    }

    /// Returns the label name this matcher inspects.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the match type.
    pub fn kind(&self) -> MatchType {
        self.kind
    }

    /// Returns the value or pattern as given.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Tests a single label value.
    pub fn matches(&self, value: &str) -> bool {
        match (self.kind, &self.re) {
            (MatchType::Equal, _) => value == self.value,
            (MatchType::NotEqual, _) => value != self.value,
            (MatchType::Regex, Some(re)) => re.is_match(value),
            (MatchType::NotRegex, Some(re)) => !re.is_match(value),
            // Regex kinds always carry a compiled pattern.
            (MatchType::Regex | MatchType::NotRegex, None) => false,
        }
    }

    /// Tests a label set, treating an absent label as `""`.
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matches(labels.get(&self.name))
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.kind == other.kind && self.value == other.value
    }
}

impl Eq for Matcher {}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.kind.operator(), self.value)
    }
}

impl FromStr for Matcher {
    type Err = QueryError;

    /// Parses `name=value`, `name!=value`, `name=~re` or `name!~re`.
    ///
    /// The value may be wrapped in double quotes.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| QueryError::InvalidMatcher {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let split = input
            .find(['=', '!'])
            .ok_or_else(|| invalid("missing operator"))?;
        let name = input[..split].trim();
        if name.is_empty() {
            return Err(invalid("missing label name"));
        }

        let rest = &input[split..];
        let (kind, value) = if let Some(v) = rest.strip_prefix("=~") {
            (MatchType::Regex, v)
        } else if let Some(v) = rest.strip_prefix("!~") {
            (MatchType::NotRegex, v)
        } else if let Some(v) = rest.strip_prefix("!=") {
            (MatchType::NotEqual, v)
        } else if let Some(v) = rest.strip_prefix('=') {
            (MatchType::Equal, v)
        } else {
            return Err(invalid("unknown operator"));
        };

        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);

        Self::new(kind, name, value)
    }
}

/// Splits matchers into residual filters and index-resolvable matchers.
///
/// Returns `(filters, matchers)`. A matcher that matches the empty string
/// becomes a filter; every other matcher can be answered by the index.
pub fn split_filters_and_matchers(all: &[Matcher]) -> (Vec<Matcher>, Vec<Matcher>) {
    all.iter().cloned().partition(|m| m.matches(""))
}

/// A pre-parsed predicate over an entry's line.
///
/// Regex filters are unanchored: `|~ "err"` keeps any line containing
/// a match.
#[derive(Debug, Clone)]
pub enum LineFilter {
    /// Keep lines containing the substring.
    Contains(String),
    /// Drop lines containing the substring.
    NotContains(String),
    /// Keep lines the regex matches somewhere.
    Regex(Regex),
    /// Drop lines the regex matches somewhere.
    NotRegex(Regex),
}

impl LineFilter {
    /// Creates a keeping regex filter.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidRegex`] if the pattern does not compile.
    pub fn regex(pattern: &str) -> Result<Self, QueryError> {
        Ok(Self::Regex(compile_line_regex(pattern)?))
    }

    /// Creates a dropping regex filter.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidRegex`] if the pattern does not compile.
    pub fn not_regex(pattern: &str) -> Result<Self, QueryError> {
        Ok(Self::NotRegex(compile_line_regex(pattern)?))
    }

    /// Tests a line.
    pub fn matches(&self, line: &str) -> bool {
        match self {
            Self::Contains(s) => line.contains(s.as_str()),
            Self::NotContains(s) => !line.contains(s.as_str()),
            Self::Regex(re) => re.is_match(line),
            Self::NotRegex(re) => !re.is_match(line),
        }
    }
}

fn compile_line_regex(pattern: &str) -> Result<Regex, QueryError> {
    Regex::new(pattern).map_err(|source| QueryError::InvalidRegex {
        pattern: pattern.to_string(),
        source,
    })
}

/// Returns `true` if every filter keeps `line`.
pub fn line_matches(filters: &[LineFilter], line: &str) -> bool {
    filters.iter().all(|f| f.matches(line))
}

/// An already-parsed log selector: stream matchers plus line filters.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    /// Label matchers; a stream must satisfy all of them.
    pub matchers: Vec<Matcher>,
    /// Line filters; an entry must satisfy all of them.
    pub filters: Vec<LineFilter>,
}

impl Selector {
    /// Creates a selector without line filters.
    pub fn new(matchers: Vec<Matcher>) -> Self {
        Self {
            matchers,
            filters: Vec::new(),
        }
    }

    /// Adds a line filter.
    #[must_use]
    pub fn with_filter(mut self, filter: LineFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Returns `true` if the label set satisfies every matcher.
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matchers.iter().all(|m| m.matches_labels(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[(&str, &str)]) -> Labels {
        let pairs: Vec<(String, String)> = items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Labels::from_pairs(&pairs).unwrap()
    }

    #[test]
    fn test_matcher_types() {
        let eq = Matcher::equal("job", "api");
        assert!(eq.matches("api"));
        assert!(!eq.matches("web"));

        let ne = Matcher::new(MatchType::NotEqual, "job", "api").unwrap();
        assert!(ne.matches("web"));
        assert!(ne.matches(""));

        let re = Matcher::new(MatchType::Regex, "job", "a.*").unwrap();
        assert!(re.matches("api"));
        assert!(!re.matches("xapi"));

        let nre = Matcher::new(MatchType::NotRegex, "job", "a.*").unwrap();
        assert!(!nre.matches("api"));
        assert!(nre.matches("web"));
    }

    #[test]
    fn test_invalid_regex() {
        let result = Matcher::new(MatchType::Regex, "job", "(");
        assert!(matches!(result, Err(QueryError::InvalidRegex { .. })));
        assert!(LineFilter::regex("[").is_err());
    }

    #[test]
    fn test_matches_labels_uses_empty_for_absent() {
        let set = labels(&[("job", "api")]);
        assert!(Matcher::equal("env", "").matches_labels(&set));
        assert!(!Matcher::equal("env", "prod").matches_labels(&set));
    }

    #[test]
    fn test_parse_matchers() {
        let m: Matcher = "job=api".parse().unwrap();
        assert_eq!(m, Matcher::equal("job", "api"));

        let m: Matcher = r#"job = "api""#.parse().unwrap();
        assert_eq!(m, Matcher::equal("job", "api"));

        let m: Matcher = "job=~api|web".parse().unwrap();
        assert_eq!(m.kind(), MatchType::Regex);
        assert_eq!(m.value(), "api|web");

        let m: Matcher = "job!~api".parse().unwrap();
        assert_eq!(m.kind(), MatchType::NotRegex);

        let m: Matcher = "job!=api".parse().unwrap();
        assert_eq!(m.kind(), MatchType::NotEqual);

        assert!("job".parse::<Matcher>().is_err());
        assert!("=api".parse::<Matcher>().is_err());
        assert!("job!api".parse::<Matcher>().is_err());
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let m = Matcher::new(MatchType::NotRegex, "env", "dev|test").unwrap();
        let parsed: Matcher = m.to_string().parse().unwrap();
        assert_eq!(m, parsed);
    }

    #[test]
    fn test_split_filters_and_matchers() {
        let all = vec![
            Matcher::equal("job", "api"),
            Matcher::equal("env", ""),
            Matcher::new(MatchType::NotEqual, "env", "dev").unwrap(),
            Matcher::new(MatchType::Regex, "pod", ".+").unwrap(),
            Matcher::new(MatchType::Regex, "pod", ".*").unwrap(),
        ];
        let (filters, matchers) = split_filters_and_matchers(&all);

        assert_eq!(matchers.len(), 2);
        assert_eq!(matchers[0].name(), "job");
        assert_eq!(matchers[1].value(), ".+");
        assert_eq!(filters.len(), 3);
    }

    #[test]
    fn test_line_filters() {
        let filters = vec![
            LineFilter::Contains("error".to_string()),
            LineFilter::NotContains("timeout".to_string()),
            LineFilter::regex(r"code=\d+").unwrap(),
        ];
        assert!(line_matches(&filters, "error code=500"));
        assert!(!line_matches(&filters, "error timeout code=500"));
        assert!(!line_matches(&filters, "error code=abc"));
        assert!(line_matches(&[], "anything"));
    }
}
