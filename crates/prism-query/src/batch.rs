//! Advisory batching of pending requests.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::request::QueryRequest;

/// A group of pending requests that could be answered by one wider query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSuggestion {
  pub model: String,
  /// Positions in the pending slice, ascending.
  pub request_indices: Vec<usize>,
  /// Dimensions every request in the group uses.
  pub shared_dimensions: Vec<String>,
  pub combined_dimensions: Vec<String>,
  pub combined_measures: Vec<String>,
}

/// Cluster requests on the same model whose dimension sets overlap.
///
/// Only requests with identical filters are grouped, since one wider query
/// cannot answer differently filtered requests. Overlap is transitive: if A shares a dimension with B and B with C, all three
/// form one group. Groups of one are omitted.
pub fn batch_opportunities(pending: &[QueryRequest]) -> Vec<BatchSuggestion> {
  let mut by_scope: BTreeMap<(&str, String), Vec<usize>> = BTreeMap::new();
  for (index, request) in pending.iter().enumerate() {
    by_scope
      .entry((request.model.as_str(), request.filter_key()))
      .or_default()
      .push(index);
  }

  let mut suggestions = Vec::new();
  for ((model, _), indices) in by_scope {
    let mut sets = DisjointSet::new(indices.len());
    for a in 0..indices.len() {
      for b in (a + 1)..indices.len() {
        let left = &pending[indices[a]].dimensions;
        let right = &pending[indices[b]].dimensions;
        if left.iter().any(|d| right.contains(d)) {
          sets.union(a, b);
        }
      }
    }

    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (position, index) in indices.iter().enumerate() {
      groups.entry(sets.find(position)).or_default().push(*index);
    }

    for members in groups.into_values().filter(|m| m.len() >= 2) {
      suggestions.push(suggest(model, members, pending));
    }
  }

  suggestions.sort_by(|a, b| {
    a.model
      .cmp(&b.model)
      .then_with(|| a.request_indices.first().cmp(&b.request_indices.first()))
  });
  suggestions
}

fn suggest(model: &str, members: Vec<usize>, pending: &[QueryRequest]) -> BatchSuggestion {
  let mut combined_dimensions: Vec<String> = Vec::new();
  let mut combined_measures: Vec<String> = Vec::new();
  for index in &members {
    let request = &pending[*index];
    for d in &request.dimensions {
      if !combined_dimensions.contains(d) {
        combined_dimensions.push(d.clone());
      }
    }
    for m in &request.measures {
      if !combined_measures.contains(m) {
        combined_measures.push(m.clone());
      }
    }
  }

  let shared_dimensions = combined_dimensions
    .iter()
    .filter(|d| members.iter().all(|i| pending[*i].dimensions.contains(*d)))
    .cloned()
    .collect();

  BatchSuggestion {
    model: model.to_string(),
    request_indices: members,
    shared_dimensions,
    combined_dimensions,
    combined_measures,
  }
}

struct DisjointSet {
  parent: Vec<usize>,
}

impl DisjointSet {
  fn new(size: usize) -> Self {
    Self {
      parent: (0..size).collect(),
    }
  }

  fn find(&mut self, mut x: usize) -> usize {
    while self.parent[x] != x {
      self.parent[x] = self.parent[self.parent[x]];
      x = self.parent[x];
    }
    x
  }

  fn union(&mut self, a: usize, b: usize) {
    let ra = self.find(a);
    let rb = self.find(b);
    if ra != rb {
      self.parent[ra.max(rb)] = ra.min(rb);
    }
  }
}
