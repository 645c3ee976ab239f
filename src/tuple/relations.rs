//! Tuples grouped by relation name.

use std::collections::BTreeMap;

use super::Tuple;

/// A set of named relations, each an ordered list of tuples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationSet {
    relations: BTreeMap<String, Vec<Tuple>>,
}

impl RelationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tuple to a relation, creating the relation on first use.
    pub fn add(&mut self, relation: &str, tuple: Tuple) {
        self.relations
            .entry(relation.to_string())
            .or_default()
            .push(tuple.with_relation(relation));
    }

    /// Add tuples by their own relation tag. Untagged tuples go to `fallback`.
    pub fn extend_tagged<I>(&mut self, tuples: I, fallback: &str)
    where
        I: IntoIterator<Item = Tuple>,
    {
        for tuple in tuples {
            let name = tuple.relation().unwrap_or(fallback).to_string();
            self.add(&name, tuple);
        }
    }

    pub fn get(&self, relation: &str) -> Option<&[Tuple]> {
        self.relations.get(relation).map(Vec::as_slice)
    }

    /// Relation names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.relations.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    /// Render one relation, one tuple per line.
    ///
    /// With `print_name` each line carries the relation name
    /// (`0.5 term(ir, d1)`), which is the form the engines accept as facts.
    /// Returns `None` for an unknown relation.
    pub fn relation_to_string(&self, relation: &str, print_name: bool) -> Option<String> {
        let tuples = self.relations.get(relation)?;
        let mut out = String::new();
        for tuple in tuples {
            if print_name {
                out.push_str(&tuple.to_line_with_relation());
            } else {
                out.push_str(&tuple.to_string());
            }
            out.push('\n');
        }
        Some(out)
    }
}
