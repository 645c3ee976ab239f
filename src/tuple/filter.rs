//! Rewriting tuple data files.
//!
//! Data files exchanged with the engines mix tuples with metadata comments
//! such as `#! number of keys: 42`. Filtering keeps those comments and blank
//! lines byte for byte and re-encodes only the tuples that are kept, so the
//! output stays readable by the engine's numeric reader.

use std::io::{BufRead, Write};

use tracing::{debug, trace};

use super::{is_data_line, Tuple};
use crate::error::EngineResult;

/// How to treat lines that do not parse as tuples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Drop the line and keep going.
    #[default]
    Lenient,
    /// Abort with the parse error.
    Strict,
}

/// Counters reported by [`filter_data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    /// Comment and blank lines copied verbatim.
    pub passthrough: usize,
    /// Tuples written to the output.
    pub kept: usize,
    /// Tuples rejected by the predicate.
    pub removed: usize,
    /// Lines dropped because they did not parse (lenient mode only).
    pub malformed: usize,
}

/// Copy `input` to `output`, keeping only tuples accepted by `keep`.
///
/// # Errors
///
/// Returns an I/O error if reading or writing fails, and in
/// [`ParseMode::Strict`] the first malformed tuple line.
///
/// # Example
///
/// ```ignore
/// let stats = filter_data(reader, &mut writer, ParseMode::Lenient, |t| t.probability() >= 0.1)?;
/// ```
pub fn filter_data<R, W, F>(
    input: R,
    mut output: W,
    mode: ParseMode,
    mut keep: F,
) -> EngineResult<FilterStats>
where
    R: BufRead,
    W: Write,
    F: FnMut(&Tuple) -> bool,
{
    let mut stats = FilterStats::default();

    for line in input.lines() {
        let line = line?;

        if !is_data_line(&line) {
            writeln!(output, "{}", line)?;
            stats.passthrough += 1;
            continue;
        }

        let tuple = match Tuple::parse(&line) {
            Ok(tuple) => tuple,
            Err(e) if mode == ParseMode::Lenient => {
                trace!("Skipping malformed line while filtering: {}", e);
                stats.malformed += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if keep(&tuple) {
            writeln!(output, "{}", tuple.to_line_with_relation())?;
            stats.kept += 1;
        } else {
            stats.removed += 1;
        }
    }

    output.flush()?;
    debug!(
        "Filtered data: {} kept, {} removed, {} malformed, {} passthrough",
        stats.kept, stats.removed, stats.malformed, stats.passthrough
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use pretty_assertions::assert_eq;

    const DATA: &str = "#! number of keys: 3\n0.9 (ir, d1)\n\n0.05 (db, d2)\nnot a tuple\n(\"x,y\", d3)\n";

    #[test]
    fn test_filter_keeps_comments_verbatim() {
        let mut out = Vec::new();
        let stats = filter_data(DATA.as_bytes(), &mut out, ParseMode::Lenient, |t| {
            t.probability() >= 0.1
        })
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "#! number of keys: 3\n0.9 (ir, d1)\n\n(\"x,y\", d3)\n");
        assert_eq!(
            stats,
            FilterStats {
                passthrough: 2,
                kept: 2,
                removed: 1,
                malformed: 1,
            }
        );
    }

    #[test]
    fn test_filter_strict_propagates_malformed_line() {
        let mut out = Vec::new();
        let result = filter_data(DATA.as_bytes(), &mut out, ParseMode::Strict, |_| true);
        assert!(matches!(result, Err(EngineError::Tuple(_))));
    }

    #[test]
    fn test_filter_preserves_relation_names() {
        let mut out = Vec::new();
        filter_data(
            "0.5 term(ir, d1)\n".as_bytes(),
            &mut out,
            ParseMode::Strict,
            |_| true,
        )
        .unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "0.5 term(ir, d1)\n");
    }

    #[test]
    fn test_filtered_output_filters_again() {
        let input = "#! keys: 2\n1 term(a, b)\n0.25 term(c, d)\n(\"x,y\")\n";
        let mut first = Vec::new();
        filter_data(input.as_bytes(), &mut first, ParseMode::Strict, |_| true).unwrap();
        assert_eq!(
            String::from_utf8(first.clone()).unwrap(),
            "#! keys: 2\n1 term(a, b)\n0.25 term(c, d)\n(\"x,y\")\n"
        );

        let mut second = Vec::new();
        let stats =
            filter_data(first.as_slice(), &mut second, ParseMode::Strict, |_| true).unwrap();
        assert_eq!(second, first);
        assert_eq!(stats.kept, 3);
    }
}
