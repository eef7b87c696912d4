use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::cmp::Reverse;

use crate::step::StepDefinition;

/// Dependency graph of a template, for traversal and analysis.
///
/// Edges run from a dependency to its dependent. Every list the graph hands out
/// follows the template's declaration order.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Step ids in declaration order.
  steps: Vec<String>,
  position: HashMap<String, usize>,
  /// Adjacency list: step_id -> dependents.
  adjacency: HashMap<String, Vec<String>>,
  /// Reverse adjacency: step_id -> dependencies.
  reverse_adjacency: HashMap<String, Vec<String>>,
  /// Steps with no dependencies.
  entry_points: Vec<String>,
  /// Steps with several dependencies (fan-in points).
  join_points: HashSet<String>,
}

impl Graph {
  /// Build a graph from step definitions.
  ///
  /// Dependencies on ids that are not among `steps` are ignored; template
  /// validation reports them before a graph is built.
  pub fn new(steps: &[StepDefinition]) -> Self {
    let ids: Vec<String> = steps.iter().map(|s| s.id.clone()).collect();
    let position: HashMap<String, usize> =
      ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();

    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    let mut reverse_adjacency: HashMap<String, Vec<String>> = HashMap::new();
    for id in &ids {
      adjacency.entry(id.clone()).or_default();
      reverse_adjacency.entry(id.clone()).or_default();
    }

    for step in steps {
      for dependency in &step.depends_on {
        if !position.contains_key(dependency) {
          continue;
        }
        let upstream = reverse_adjacency.entry(step.id.clone()).or_default();
        if upstream.contains(dependency) {
          continue;
        }
        upstream.push(dependency.clone());
        adjacency
          .entry(dependency.clone())
          .or_default()
          .push(step.id.clone());
      }
    }

    for list in adjacency.values_mut().chain(reverse_adjacency.values_mut()) {
      list.sort_by_key(|id| position[id]);
    }

    let entry_points: Vec<String> = ids
      .iter()
      .filter(|id| reverse_adjacency.get(*id).is_none_or(|v| v.is_empty()))
      .cloned()
      .collect();

    let join_points: HashSet<String> = reverse_adjacency
      .iter()
      .filter(|(_, incoming)| incoming.len() > 1)
      .map(|(id, _)| id.clone())
      .collect();

    Self {
      steps: ids,
      position,
      adjacency,
      reverse_adjacency,
      entry_points,
      join_points,
    }
  }

  pub fn steps(&self) -> &[String] {
    &self.steps
  }

  pub fn contains(&self, step_id: &str) -> bool {
    self.position.contains_key(step_id)
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }

  /// Get entry points (steps with no dependencies).
  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  /// Get the dependents of a step.
  pub fn downstream(&self, step_id: &str) -> &[String] {
    self
      .adjacency
      .get(step_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Get the dependencies of a step.
  pub fn upstream(&self, step_id: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(step_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Check if a step has several dependencies.
  pub fn is_join_point(&self, step_id: &str) -> bool {
    self.join_points.contains(step_id)
  }

  /// Steps nothing depends on.
  pub fn terminals(&self) -> Vec<String> {
    self
      .steps
      .iter()
      .filter(|id| self.downstream(id).is_empty())
      .cloned()
      .collect()
  }

  /// Every step reachable from `step_id`, excluding itself.
  pub fn descendants(&self, step_id: &str) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&str> = self.downstream(step_id).iter().map(String::as_str).collect();
    while let Some(id) = stack.pop() {
      if seen.insert(id.to_string()) {
        stack.extend(self.downstream(id).iter().map(String::as_str));
      }
    }
    seen
  }

  /// Kahn's algorithm, breaking ties by declaration order.
  ///
  /// On a cycle, returns the steps that could not be ordered: every step on a
  /// cycle and everything downstream of one.
  pub fn topological_order(&self) -> Result<Vec<String>, Vec<String>> {
    let mut remaining: HashMap<&str, usize> = self
      .steps
      .iter()
      .map(|id| (id.as_str(), self.upstream(id).len()))
      .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = self
      .entry_points
      .iter()
      .map(|id| Reverse(self.position[id]))
      .collect();

    let mut order = Vec::with_capacity(self.steps.len());
    while let Some(Reverse(index)) = ready.pop() {
      let id = &self.steps[index];
      order.push(id.clone());
      for next in self.downstream(id) {
        if let Some(count) = remaining.get_mut(next.as_str()) {
          *count -= 1;
          if *count == 0 {
            ready.push(Reverse(self.position[next]));
          }
        }
      }
    }

    if order.len() == self.steps.len() {
      Ok(order)
    } else {
      let ordered: HashSet<&String> = order.iter().collect();
      Err(
        self
          .steps
          .iter()
          .filter(|id| !ordered.contains(id))
          .cloned()
          .collect(),
      )
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::step::{InsightSynthesisStep, StepKind};

  fn step(id: &str, deps: &[&str]) -> StepDefinition {
    StepDefinition::new(id, StepKind::InsightSynthesis(InsightSynthesisStep::default()))
      .depends_on(deps.iter().copied())
  }

  #[test]
  fn test_diamond_structure() {
    let steps = vec![
      step("a", &[]),
      step("c", &["a"]),
      step("b", &["a"]),
      step("d", &["b", "c"]),
    ];
    let graph = Graph::new(&steps);

    assert_eq!(graph.entry_points(), ["a"]);
    assert_eq!(graph.downstream("a"), ["c", "b"]);
    assert_eq!(graph.upstream("d"), ["c", "b"]);
    assert!(graph.is_join_point("d"));
    assert!(!graph.is_join_point("b"));
    assert_eq!(graph.terminals(), vec!["d"]);
    assert_eq!(graph.topological_order().unwrap(), vec!["a", "c", "b", "d"]);
  }

  #[test]
  fn test_descendants() {
    let steps = vec![
      step("a", &[]),
      step("b", &["a"]),
      step("c", &["b"]),
      step("x", &[]),
      step("y", &["x", "c"]),
    ];
    let graph = Graph::new(&steps);

    let expected: BTreeSet<String> = ["b", "c", "y"].iter().map(|s| s.to_string()).collect();
    assert_eq!(graph.descendants("a"), expected);
    assert!(graph.descendants("y").is_empty());
  }

  #[test]
  fn test_cycle_reports_unorderable_steps() {
    let steps = vec![
      step("a", &[]),
      step("b", &["a", "d"]),
      step("c", &["b"]),
      step("d", &["c"]),
      step("e", &["a"]),
    ];
    let graph = Graph::new(&steps);

    assert_eq!(graph.topological_order().unwrap_err(), vec!["b", "c", "d"]);
  }

  #[test]
  fn test_duplicate_dependencies_collapse() {
    let steps = vec![step("a", &[]), step("b", &["a", "a"])];
    let graph = Graph::new(&steps);
    assert_eq!(graph.upstream("b"), ["a"]);
    assert!(!graph.is_join_point("b"));
  }
}
