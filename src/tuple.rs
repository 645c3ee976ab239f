//! Probabilistic tuples and the engine's line format.
//!
//! Every data line an inference engine prints has the shape
//!
//! ```text
//! [<probability>] [<relation>](<value>, <value>, ...)
//! ```
//!
//! The probability is a decimal starting with `0` or `1` and defaults to 1
//! when omitted. Values are bare tokens or double-quoted strings; commas
//! inside quotes do not separate values. Lines starting with `#` are
//! comments (e.g. `#! number of keys: 12`) and, like blank lines, are not
//! tuples: callers filter them with [`is_data_line`] before parsing.

mod filter;
mod relations;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::TupleError;

pub use filter::{filter_data, FilterStats, ParseMode};
pub use relations::RelationSet;

/// Number of fractional digits used when printing probabilities.
const PROBABILITY_DIGITS: usize = 6;

// =============================================================================
// Tuple
// =============================================================================

/// A probability-weighted, ordered list of attribute values.
///
/// Equality is structural: probability bits, values and relation tag.
/// Probability order is not consistent with equality, so there is no `Ord`
/// impl; use [`Tuple::cmp_by_probability`] or [`sort_by_probability`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tuple {
    probability: f64,
    values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    relation: Option<String>,
}

impl Tuple {
    /// Create a tuple with an explicit probability.
    ///
    /// The probability is clamped into [0, 1].
    pub fn new<I, S>(probability: f64, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            probability: probability.clamp(0.0, 1.0),
            values: values.into_iter().map(Into::into).collect(),
            relation: None,
        }
    }

    /// Create a tuple with probability 1.
    pub fn certain<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(1.0, values)
    }

    /// Attach a relation name.
    pub fn with_relation(mut self, relation: impl Into<String>) -> Self {
        self.relation = Some(relation.into());
        self
    }

    /// Parse one output line.
    ///
    /// # Errors
    ///
    /// Returns a [`TupleError`] if the probability prefix is malformed, the
    /// parentheses are missing or unbalanced, or a quoted value is not closed.
    ///
    /// # Example
    ///
    /// ```
    /// use tuplepipe::tuple::Tuple;
    ///
    /// let t = Tuple::parse("0.5 (\"x,y\", z)").unwrap();
    /// assert_eq!(t.probability(), 0.5);
    /// assert_eq!(t.values(), ["x,y", "z"]);
    /// ```
    pub fn parse(line: &str) -> Result<Self, TupleError> {
        let body = line.trim_start();
        let (probability, rest) = match body.chars().next() {
            Some('0') | Some('1') => parse_probability(line, body)?,
            Some('(') => (1.0, body),
            _ => return Err(TupleError::MalformedProbability(line.to_string())),
        };

        let rest = rest.trim_start();
        let relation_len = rest
            .char_indices()
            .take_while(|(i, c)| {
                if *i == 0 {
                    c.is_ascii_alphabetic() || *c == '_'
                } else {
                    c.is_ascii_alphanumeric() || *c == '_'
                }
            })
            .count();
        let relation = (relation_len > 0).then(|| rest[..relation_len].to_string());
        let list = rest[relation_len..].trim_start().trim_end();

        if !list.starts_with('(') || !list.ends_with(')') || list.len() < 2 {
            return Err(TupleError::MissingParentheses(line.to_string()));
        }
        let inner = &list[1..list.len() - 1];
        let inner_offset = line.trim_end().len() - list.len() + 1;
        let values = split_values(line, inner, inner_offset)?;

        Ok(Self {
            probability,
            values,
            relation,
        })
    }

    /// The tuple probability in [0, 1].
    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// The attribute values in order.
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// The attribute value at `index`, if present.
    pub fn value_at(&self, index: usize) -> Option<&str> {
        self.values.get(index).map(String::as_str)
    }

    /// Number of attribute values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the tuple has no attribute values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The relation tag, if one was parsed or attached.
    pub fn relation(&self) -> Option<&str> {
        self.relation.as_deref()
    }

    /// Probability in the engine's numeric format.
    pub fn probability_string(&self) -> String {
        format_probability(self.probability)
    }

    /// Descending probability order, the natural order of engine results.
    pub fn cmp_by_probability(&self, other: &Self) -> Ordering {
        other.probability.total_cmp(&self.probability)
    }

    /// Encode including the relation name, e.g. `0.5 term(ir, d1)`.
    ///
    /// A named line always carries its probability, since `term(..)`
    /// without a prefix does not parse.
    pub fn to_line_with_relation(&self) -> String {
        let mut line = String::new();
        if self.probability != 1.0 || self.relation.is_some() {
            line.push_str(&self.probability_string());
            line.push(' ');
        }
        if let Some(relation) = &self.relation {
            line.push_str(relation);
        }
        line.push_str(&self.value_list());
        line
    }

    fn value_list(&self) -> String {
        let encoded: Vec<String> = self.values.iter().map(|v| encode_value(v)).collect();
        format!("({})", encoded.join(", "))
    }
}

/// Encodes as `<prob> (<v1>, <v2>)`; a probability of exactly 1 is omitted.
impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.probability != 1.0 {
            write!(f, "{} ", self.probability_string())?;
        }
        f.write_str(&self.value_list())
    }
}

impl FromStr for Tuple {
    type Err = TupleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Tuple::parse(s)
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.probability.to_bits() == other.probability.to_bits()
            && self.values == other.values
            && self.relation == other.relation
    }
}

impl Eq for Tuple {}

impl Hash for Tuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.probability.to_bits().hash(state);
        self.values.hash(state);
        self.relation.hash(state);
    }
}

// =============================================================================
// Line helpers
// =============================================================================

/// Whether a line can carry a tuple (not blank, not a `#` comment).
pub fn is_data_line(line: &str) -> bool {
    let trimmed = line.trim();
    !trimmed.is_empty() && !trimmed.starts_with('#')
}

/// Parse a segment of raw output lines leniently.
///
/// Comment and blank lines are skipped, as is any line matching `skip`
/// (the delimiter echo). Lines that fail to parse are dropped and counted.
/// Returns the tuples in output order and the number of dropped lines.
pub fn collect_tuples<'a, I>(lines: I, skip: Option<&Regex>) -> (Vec<Tuple>, usize)
where
    I: IntoIterator<Item = &'a str>,
{
    let mut tuples = Vec::new();
    let mut malformed = 0;

    for line in lines {
        if !is_data_line(line) || skip.is_some_and(|re| re.is_match(line)) {
            continue;
        }
        match Tuple::parse(line) {
            Ok(tuple) => tuples.push(tuple),
            Err(e) => {
                trace!("Dropping malformed tuple line: {}", e);
                malformed += 1;
            }
        }
    }

    (tuples, malformed)
}

/// Stable sort by descending probability.
pub fn sort_by_probability(tuples: &mut [Tuple]) {
    tuples.sort_by(Tuple::cmp_by_probability);
}

/// Format a probability with fixed notation, at most six fractional digits,
/// trailing zeros removed and always a `.` decimal point.
pub fn format_probability(probability: f64) -> String {
    let fixed = format!("{:.*}", PROBABILITY_DIGITS, probability);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "" | "-0" => "0".to_string(),
        other => other.to_string(),
    }
}

/// Quote a value when it would not survive parsing as a bare token.
pub fn encode_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.contains(',')
        || value.contains('(')
        || value.contains(')')
        || value.trim() != value;
    if needs_quotes {
        format!("\"{}\"", value)
    } else {
        value.to_string()
    }
}

// =============================================================================
// Parsing internals
// =============================================================================

/// Parse the `[01](\.[0-9]*)?` prefix of `body`.
fn parse_probability<'a>(line: &str, body: &'a str) -> Result<(f64, &'a str), TupleError> {
    let bytes = body.as_bytes();
    let mut end = 1;
    if bytes.get(end) == Some(&b'.') {
        end += 1;
        while bytes.get(end).is_some_and(u8::is_ascii_digit) {
            end += 1;
        }
    }

    // "10 (a)" or "0x (a)" is not a probability
    if bytes
        .get(end)
        .is_some_and(|b| b.is_ascii_digit() || *b == b'.')
    {
        return Err(TupleError::MalformedProbability(line.to_string()));
    }

    let probability: f64 = body[..end]
        .trim_end_matches('.')
        .parse()
        .map_err(|_| TupleError::MalformedProbability(line.to_string()))?;
    if !(0.0..=1.0).contains(&probability) {
        return Err(TupleError::MalformedProbability(line.to_string()));
    }

    Ok((probability, &body[end..]))
}

/// Split the text between the outer parentheses into values.
fn split_values(line: &str, inner: &str, inner_offset: usize) -> Result<Vec<String>, TupleError> {
    let mut values = Vec::new();
    if inner.trim().is_empty() {
        return Ok(values);
    }

    let offset_of = |rest: &str| inner_offset + inner.len() - rest.len();
    let mut rest = inner;

    loop {
        rest = rest.trim_start();

        if let Some(body) = rest.strip_prefix('"') {
            let close = body
                .find('"')
                .ok_or_else(|| TupleError::UnterminatedQuote(line.to_string()))?;
            values.push(body[..close].to_string());
            rest = body[close + 1..].trim_start();

            match rest.chars().next() {
                None => break,
                Some(',') => rest = &rest[1..],
                Some(found) => {
                    return Err(TupleError::UnexpectedCharacter {
                        line: line.to_string(),
                        found,
                        offset: offset_of(rest),
                    })
                }
            }
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let token = &rest[..end];
            if let Some(pos) = token.find('"') {
                return Err(TupleError::UnexpectedCharacter {
                    line: line.to_string(),
                    found: '"',
                    offset: offset_of(rest) + pos,
                });
            }
            if !parens_balanced(token) {
                return Err(TupleError::MissingParentheses(line.to_string()));
            }
            values.push(token.trim().to_string());

            if end == rest.len() {
                break;
            }
            rest = &rest[end + 1..];
        }

        // a trailing comma does not open another value
        if rest.trim().is_empty() {
            break;
        }
    }

    Ok(values)
}

fn parens_balanced(token: &str) -> bool {
    let mut depth: i32 = 0;
    for c in token.chars() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}
