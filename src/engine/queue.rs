//! Pipelined query batches and their demultiplexed results.
//!
//! A batch is written to the engine in one go, each query followed by the
//! echo directive. The engine answers in order, one delimiter per query, and
//! a queue-mode [`LineSink`] attributes every segment to the next pending id.

use std::collections::{HashMap, HashSet};

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::stream::LineSink;
use crate::tuple::{collect_tuples, Tuple};

/// One queued program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub id: String,
    pub text: String,
}

/// Queries waiting to be executed, in submission order.
#[derive(Debug, Default)]
pub struct QueryQueue {
    queries: Vec<Query>,
    ids: HashSet<String>,
}

impl QueryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a query.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DuplicateQuery`] if `id` is already queued.
    pub fn enqueue(&mut self, id: impl Into<String>, text: impl Into<String>) -> EngineResult<()> {
        let id = id.into();
        if !self.ids.insert(id.clone()) {
            return Err(EngineError::DuplicateQuery(id));
        }
        self.queries.push(Query {
            id,
            text: text.into(),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.queries.iter().map(|q| q.id.as_str())
    }

    pub fn clear(&mut self) {
        self.queries.clear();
        self.ids.clear();
    }

    /// Remove and return every queued query, leaving the queue empty.
    pub fn take(&mut self) -> Vec<Query> {
        self.ids.clear();
        std::mem::take(&mut self.queries)
    }
}

/// Tuples per query id, plus the bookkeeping needed to detect a batch cut
/// short by the engine.
///
/// A query whose delimiter never arrived maps to an empty list, exactly like
/// a query that legitimately produced no tuples. Compare
/// [`observed`](Self::observed) with [`submitted`](Self::submitted), or check
/// [`is_partial`](Self::is_partial), to tell a truncated batch apart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResults {
    order: Vec<String>,
    results: HashMap<String, Vec<Tuple>>,
    observed: usize,
    malformed: usize,
    unattributed: usize,
}

impl QueryResults {
    /// Tuples for `id`; empty for unknown or unanswered ids.
    pub fn get(&self, id: &str) -> &[Tuple] {
        self.results.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Move the tuples for `id` out of the results.
    pub fn take(&mut self, id: &str) -> Vec<Tuple> {
        self.results
            .get_mut(id)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Query ids in submission order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// `(id, tuples)` pairs in submission order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Tuple])> {
        self.order.iter().map(|id| (id.as_str(), self.get(id)))
    }

    pub fn into_map(self) -> HashMap<String, Vec<Tuple>> {
        self.results
    }

    /// Number of queries in the batch.
    pub fn submitted(&self) -> usize {
        self.order.len()
    }

    /// Number of delimiters seen, i.e. queries whose segment was closed.
    pub fn observed(&self) -> usize {
        self.observed
    }

    /// Whether the engine stopped answering before the end of the batch.
    pub fn is_partial(&self) -> bool {
        self.observed < self.order.len()
    }

    /// Lines dropped because they did not parse as tuples.
    pub fn malformed_lines(&self) -> usize {
        self.malformed
    }

    /// Output lines that could not be attributed to a query.
    pub fn unattributed_lines(&self) -> usize {
        self.unattributed
    }
}

/// Wait for a queue-mode sink and turn its segments into per-query tuples.
///
/// Comment and blank lines, echoed delimiters and malformed lines are
/// skipped. Ids whose segment was never closed map to an empty list.
pub fn demultiplex(ids: Vec<String>, sink: &LineSink, delimiter: &Regex) -> QueryResults {
    let segments = sink.segments();
    let observed = segments.len();

    let mut results: HashMap<String, Vec<Tuple>> =
        ids.iter().map(|id| (id.clone(), Vec::new())).collect();
    let mut malformed = 0;

    for (id, lines) in segments {
        let (tuples, dropped) = collect_tuples(lines.iter().map(String::as_str), Some(delimiter));
        malformed += dropped;
        results.insert(id, tuples);
    }

    let unattributed = sink.unattributed_lines();
    if observed < ids.len() {
        warn!(
            "Engine answered {} of {} queued queries ({} unattributed lines)",
            observed,
            ids.len(),
            unattributed
        );
    } else {
        debug!("Demultiplexed {} queries", observed);
    }

    QueryResults {
        order: ids,
        results,
        observed,
        malformed,
        unattributed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn end() -> Regex {
        Regex::new("^END$").unwrap()
    }

    fn run_batch(ids: &[&str], output: &str) -> QueryResults {
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        let sink = LineSink::for_queue(end(), ids.clone());
        sink.start_on(Cursor::new(output.to_string())).unwrap();
        demultiplex(ids, &sink, &end())
    }

    #[test]
    fn test_enqueue_rejects_duplicates() {
        let mut queue = QueryQueue::new();
        queue.enqueue("q1", "?- a(X).").unwrap();
        queue.enqueue("q2", "?- b(X).").unwrap();
        assert!(matches!(
            queue.enqueue("q1", "again"),
            Err(EngineError::DuplicateQuery(id)) if id == "q1"
        ));
        assert_eq!(queue.ids().collect::<Vec<_>>(), ["q1", "q2"]);

        let taken = queue.take();
        assert_eq!(taken.len(), 2);
        assert!(queue.is_empty());
        // Ids may be reused once the batch is taken.
        queue.enqueue("q1", "?- c(X).").unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_fifo_demux() {
        let results = run_batch(
            &["q1", "q2"],
            "0.35 (d2)\n0.2 (d7)\nEND\n(ir)\nEND\n",
        );
        assert_eq!(
            results.get("q1"),
            [Tuple::new(0.35, ["d2"]), Tuple::new(0.2, ["d7"])]
        );
        assert_eq!(results.get("q2"), [Tuple::certain(["ir"])]);
        assert!(!results.is_partial());
        assert_eq!(results.ids().collect::<Vec<_>>(), ["q1", "q2"]);
    }

    #[test]
    fn test_comments_and_blanks_are_skipped() {
        let results = run_batch(&["q"], "# note\n\n0.3 (a)\nEND\n");
        assert_eq!(results.get("q"), [Tuple::new(0.3, ["a"])]);
        assert_eq!(results.malformed_lines(), 0);
    }

    #[test]
    fn test_partial_result() {
        let results = run_batch(&["q1", "q2", "q3"], "(a)\nEND\n(b)\n");
        assert_eq!(results.get("q1"), [Tuple::certain(["a"])]);
        assert!(results.get("q2").is_empty());
        assert!(results.get("q3").is_empty());
        assert_eq!(results.submitted(), 3);
        assert_eq!(results.observed(), 1);
        assert!(results.is_partial());
        assert_eq!(results.unattributed_lines(), 1);
    }

    #[test]
    fn test_malformed_lines_are_counted() {
        let mut results = run_batch(&["q"], "(a)\nnot a tuple\n0.5 (b\nEND\n");
        assert_eq!(results.malformed_lines(), 2);
        assert_eq!(results.take("q"), vec![Tuple::certain(["a"])]);
        assert!(results.get("q").is_empty());
        assert!(results.take("unknown").is_empty());
    }

    #[test]
    fn test_iter_and_into_map() {
        let results = run_batch(&["b", "a"], "(1)\nEND\n(2)\nEND\n");
        let pairs: Vec<(&str, usize)> = results.iter().map(|(id, t)| (id, t.len())).collect();
        assert_eq!(pairs, vec![("b", 1), ("a", 1)]);
        let map = results.into_map();
        assert_eq!(map["a"], vec![Tuple::certain(["2"])]);
    }
}
