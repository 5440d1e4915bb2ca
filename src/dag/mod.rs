//! Task DAG: tasks + dependencies → validated graph; ready-set and
//! execution-level derivation.
//!
//! Wave computation over a dynamic task set built by the planner at
//! runtime, keyed by `TaskID` rather than a fixed array index.

use crate::errors::{DomainError, Result};
use std::collections::{HashMap, HashSet};

/// A task as seen by the DAG — just enough to validate structure and derive
/// ready sets; execution detail lives in `TaskState`.
#[derive(Debug, Clone)]
pub struct DagTask {
    pub id: String,
    pub dependencies: Vec<String>,
}

impl DagTask {
    pub fn new(id: impl Into<String>, dependencies: Vec<String>) -> Self {
        Self {
            id: id.into(),
            dependencies,
        }
    }
}

/// Builder: `AddTask` (reject duplicates), `AddDependency` (programmatic —
/// fails loudly on an unknown task), `Build` (validates, no cycles).
#[derive(Debug, Default)]
pub struct DagBuilder {
    tasks: Vec<DagTask>,
    ids: HashSet<String>,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, id: impl Into<String>) -> Result<()> {
        let id = id.into();
        if !self.ids.insert(id.clone()) {
            return Err(DomainError::Validation(format!(
                "duplicate task id '{id}'"
            )));
        }
        self.tasks.push(DagTask::new(id, Vec::new()));
        Ok(())
    }

    /// `from` depends on `to`: `to` must complete before `from`. Fails
    /// loudly if either task is unknown — this is the programmatic path;
    /// the disk-parsing path drops unknown dependencies silently instead
    /// (see [`TaskGraph::from_tasks_lenient`]).
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.ids.contains(from) {
            return Err(DomainError::Validation(format!(
                "cannot add dependency: unknown task '{from}'"
            )));
        }
        if !self.ids.contains(to) {
            return Err(DomainError::Validation(format!(
                "cannot add dependency: unknown task '{to}'"
            )));
        }
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == from)
            .expect("from id was just validated present");
        if !task.dependencies.contains(&to.to_string()) {
            task.dependencies.push(to.to_string());
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.ids.clear();
    }

    pub fn build(self) -> Result<TaskGraph> {
        TaskGraph::new(self.tasks)
    }
}

/// A validated, acyclic task graph with fast ready-set and execution-level
/// queries.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    index_of: HashMap<String, usize>,
    tasks: Vec<DagTask>,
}

impl TaskGraph {
    fn new(tasks: Vec<DagTask>) -> Result<Self> {
        let mut index_of = HashMap::new();
        for (i, t) in tasks.iter().enumerate() {
            index_of.insert(t.id.clone(), i);
        }
        let graph = Self { index_of, tasks };
        graph.validate_no_cycles()?;
        Ok(graph)
    }

    /// Builds a graph from tasks parsed off disk: a dependency referencing
    /// a non-existent task is silently dropped (graceful degradation under
    /// partial failure) rather than rejected. Returns the dropped
    /// dependency edges too, so the caller can `tracing::warn!` about them.
    pub fn from_tasks_lenient(raw: Vec<DagTask>) -> (Self, Vec<(String, String)>) {
        let ids: HashSet<String> = raw.iter().map(|t| t.id.clone()).collect();
        let mut dropped = Vec::new();
        let tasks: Vec<DagTask> = raw
            .into_iter()
            .map(|mut t| {
                let (kept, removed): (Vec<_>, Vec<_>) =
                    t.dependencies.into_iter().partition(|d| ids.contains(d));
                for r in removed {
                    dropped.push((t.id.clone(), r));
                }
                t.dependencies = kept;
                t
            })
            .collect();
        let mut index_of = HashMap::new();
        for (i, t) in tasks.iter().enumerate() {
            index_of.insert(t.id.clone(), i);
        }
        let graph = Self { index_of, tasks };
        (graph, dropped)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task_ids(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.id.as_str()).collect()
    }

    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.index_of
            .get(id)
            .and_then(|&i| self.tasks.get(i))
            .map(|t| t.dependencies.as_slice())
            .unwrap_or(&[])
    }

    /// Tasks whose dependencies are all in `completed` and which are not
    /// themselves already in `completed`.
    pub fn ready_tasks(&self, completed: &HashSet<String>) -> Vec<String> {
        let mut ready: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| !completed.contains(&t.id))
            .filter(|t| t.dependencies.iter().all(|d| completed.contains(d)))
            .map(|t| t.id.clone())
            .collect();
        ready.sort();
        ready
    }

    /// Execution levels: level 0 = in-degree 0; level k+1 = tasks whose
    /// dependencies all lie in levels <= k. Deterministic within a level
    /// (sorted by id) for testability.
    pub fn execution_levels(&self) -> Vec<Vec<String>> {
        let mut levels = Vec::new();
        let mut completed: HashSet<String> = HashSet::new();
        loop {
            let ready = self.ready_tasks(&completed);
            if ready.is_empty() {
                break;
            }
            completed.extend(ready.iter().cloned());
            levels.push(ready);
        }
        levels
    }

    fn validate_no_cycles(&self) -> Result<()> {
        let mut in_degree: Vec<usize> = vec![0; self.tasks.len()];
        for t in &self.tasks {
            let idx = self.index_of[&t.id];
            in_degree[idx] = t.dependencies.len();
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for t in &self.tasks {
            let to_idx = self.index_of[&t.id];
            for dep in &t.dependencies {
                if let Some(&from_idx) = self.index_of.get(dep) {
                    dependents[from_idx].push(to_idx);
                }
            }
        }

        let mut queue: Vec<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.tasks.len() {
            let unassigned: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, &deg)| deg > 0)
                .map(|(i, _)| self.tasks[i].id.as_str())
                .collect();
            return Err(DomainError::Validation(format!(
                "circular dependency detected; unassigned tasks: {unassigned:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &[&str])]) -> Result<TaskGraph> {
        let mut builder = DagBuilder::new();
        for (id, _) in edges {
            builder.add_task(*id)?;
        }
        for (id, deps) in edges {
            for dep in *deps {
                builder.add_dependency(id, dep)?;
            }
        }
        builder.build()
    }

    #[test]
    fn execution_levels_cover_every_task_exactly_once() {
        let g = graph(&[
            ("a", &[]),
            ("b", &[]),
            ("c", &["a", "b"]),
            ("d", &["c"]),
        ])
        .unwrap();
        let levels = g.execution_levels();
        assert_eq!(
            levels,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn self_referential_dependency_is_a_cycle() {
        let mut builder = DagBuilder::new();
        builder.add_task("a").unwrap();
        builder.add_dependency("a", "a").unwrap();
        let err = builder.build().unwrap_err();
        assert!(err.to_string().contains("circular dependency"));
        assert!(err.to_string().contains('a'));
    }

    #[test]
    fn duplicate_task_is_rejected() {
        let mut builder = DagBuilder::new();
        builder.add_task("a").unwrap();
        assert!(builder.add_task("a").is_err());
    }

    #[test]
    fn programmatic_missing_dependency_fails_loudly() {
        let mut builder = DagBuilder::new();
        builder.add_task("a").unwrap();
        assert!(builder.add_dependency("a", "ghost").is_err());
    }

    #[test]
    fn disk_parsed_missing_dependency_is_dropped_silently() {
        let raw = vec![DagTask::new("a", vec!["ghost".to_string()])];
        let (graph, dropped) = TaskGraph::from_tasks_lenient(raw);
        assert_eq!(dropped, vec![("a".to_string(), "ghost".to_string())]);
        assert!(graph.dependencies_of("a").is_empty());
    }

    #[test]
    fn ready_tasks_respects_completed_set() {
        let g = graph(&[("a", &[]), ("b", &["a"])]).unwrap();
        let mut completed = HashSet::new();
        assert_eq!(g.ready_tasks(&completed), vec!["a".to_string()]);
        completed.insert("a".to_string());
        assert_eq!(g.ready_tasks(&completed), vec!["b".to_string()]);
    }
}
