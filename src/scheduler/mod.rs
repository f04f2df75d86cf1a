//! Task graph scheduling.
//!
//! A simulation step is a static DAG of fine-grained tasks (component
//! pre-steps, the linear solve, post-steps). Tasks declare which attributes
//! they read and write; [`resolve_dependencies`] turns those declarations
//! into an edge set, [`topological_sort`] orders it and
//! [`level_schedule`] groups it into levels of mutually independent tasks.
//! The executors in the submodules walk that level schedule sequentially,
//! thread-parallel or rank-parallel.

pub mod distributed;
pub mod parallel;
pub mod sequential;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use indexmap::{IndexMap, IndexSet};

use crate::attribute::AttributeId;
use crate::error::{Error, Result};

/// A named unit of work executed once per simulation step.
///
/// The three dependency sets drive schedule creation:
/// - `previous_step_dependencies` are reads of last tick's value and produce
///   no ordering edges,
/// - `attribute_dependencies` are reads of the current tick's value and force
///   the writer to run first,
/// - `modified_attributes` must cover every attribute the task actually
///   mutates, otherwise the schedule is unsound.
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Partition tag used by the distributed executor.
    fn subsystem(&self) -> usize {
        0
    }

    fn previous_step_dependencies(&self) -> Vec<AttributeId> {
        Vec::new()
    }

    fn attribute_dependencies(&self) -> Vec<AttributeId> {
        Vec::new()
    }

    fn modified_attributes(&self) -> Vec<AttributeId> {
        Vec::new()
    }

    fn execute(&self, time: f64, step_count: usize);
}

pub type TaskList = Vec<Arc<dyn Task>>;

/// Predecessor/successor sets keyed by task index into the task list.
pub type Edges = IndexMap<usize, IndexSet<usize>>;

/// Builds the edge set from the tasks' attribute declarations.
///
/// For every attribute, each writer gets an edge to each same-tick reader.
/// Previous-step reads are ignored and self-loops are discarded.
pub fn resolve_dependencies(tasks: &[Arc<dyn Task>]) -> (Edges, Edges) {
    let mut writers: IndexMap<AttributeId, Vec<usize>> = IndexMap::new();
    for (idx, task) in tasks.iter().enumerate() {
        for attr in task.modified_attributes() {
            writers.entry(attr).or_default().push(idx);
        }
    }

    let mut in_edges: Edges = IndexMap::new();
    let mut out_edges: Edges = IndexMap::new();
    for idx in 0..tasks.len() {
        in_edges.entry(idx).or_default();
        out_edges.entry(idx).or_default();
    }

    for (reader, task) in tasks.iter().enumerate() {
        for attr in task.attribute_dependencies() {
            let Some(ws) = writers.get(&attr) else {
                continue;
            };
            for &writer in ws {
                if writer == reader {
                    continue;
                }
                in_edges[&reader].insert(writer);
                out_edges[&writer].insert(reader);
            }
        }
    }

    (in_edges, out_edges)
}

/// Kahn's algorithm with deterministic tie-breaking: the zero-in-degree
/// frontier is consumed in task insertion order.
///
/// Fails with a scheduling error naming the offending tasks if the graph
/// contains a cycle.
pub fn topological_sort(
    tasks: &[Arc<dyn Task>],
    in_edges: &Edges,
    out_edges: &Edges,
) -> Result<Vec<usize>> {
    let mut degree: Vec<usize> = (0..tasks.len())
        .map(|i| in_edges.get(&i).map_or(0, IndexSet::len))
        .collect();

    let mut frontier: VecDeque<usize> = (0..tasks.len()).filter(|&i| degree[i] == 0).collect();
    let mut ordered = Vec::with_capacity(tasks.len());

    while let Some(idx) = frontier.pop_front() {
        ordered.push(idx);
        if let Some(succs) = out_edges.get(&idx) {
            for &succ in succs {
                degree[succ] -= 1;
                if degree[succ] == 0 {
                    frontier.push_back(succ);
                }
            }
        }
    }

    if ordered.len() != tasks.len() {
        let cycle = (0..tasks.len())
            .filter(|&i| degree[i] > 0)
            .map(|i| tasks[i].name().to_owned())
            .collect();
        return Err(Error::Scheduling { tasks: cycle });
    }

    Ok(ordered)
}

/// Groups a topological order into levels: `level(t)` is one more than the
/// maximum level of its predecessors, zero without predecessors. No edge has
/// both endpoints in the same level.
pub fn level_schedule(order: &[usize], in_edges: &Edges) -> Vec<Vec<usize>> {
    let mut level_of: IndexMap<usize, usize> = IndexMap::new();
    let mut levels: Vec<Vec<usize>> = Vec::new();

    for &idx in order {
        let level = in_edges
            .get(&idx)
            .into_iter()
            .flatten()
            .map(|pred| level_of[pred] + 1)
            .max()
            .unwrap_or(0);
        level_of.insert(idx, level);
        if level == levels.len() {
            levels.push(Vec::new());
        }
        levels[level].push(idx);
    }

    levels
}

/// Executes the level schedule once per tick.
pub trait Scheduler {
    /// Resolves the task list into an executable schedule. Fails on cycles.
    fn create_schedule(&mut self, tasks: TaskList, in_edges: &Edges, out_edges: &Edges)
        -> Result<()>;

    /// Runs one simulation step at `time`.
    fn step(&mut self, time: f64, step_count: usize);

    /// Flushes measurements and releases executor resources. Idempotent.
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Per-task wall-clock samples, written as `task;mean_ns;stddev_ns;count`.
#[derive(Debug, Default)]
pub struct TaskMeasurements {
    names: Vec<String>,
    samples: Vec<Vec<u64>>,
}

impl TaskMeasurements {
    pub fn new(tasks: &[Arc<dyn Task>]) -> Self {
        Self {
            names: tasks.iter().map(|t| t.name().to_owned()).collect(),
            samples: vec![Vec::new(); tasks.len()],
        }
    }

    pub fn record(&mut self, task_idx: usize, elapsed: Duration) {
        self.samples[task_idx].push(elapsed.as_nanos() as u64);
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new().delimiter(b';').from_path(path)?;
        wtr.write_record(["task_name", "mean_ns", "stddev_ns", "count"])?;
        for (name, samples) in self.names.iter().zip(&self.samples) {
            let count = samples.len();
            let (mean, stddev) = if count == 0 {
                (0.0, 0.0)
            } else {
                let mean = samples.iter().sum::<u64>() as f64 / count as f64;
                let var = samples
                    .iter()
                    .map(|&s| {
                        let d = s as f64 - mean;
                        d * d
                    })
                    .sum::<f64>()
                    / count as f64;
                (mean, var.sqrt())
            };
            wtr.write_record([
                name.as_str(),
                &format!("{mean:.0}"),
                &format!("{stddev:.0}"),
                &count.to_string(),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::Task;
    use crate::attribute::{Attr, AttributeId};

    /// Appends its own name to a shared trace when executed.
    pub(crate) struct RecordingTask {
        name: &'static str,
        trace: Attr<Vec<&'static str>>,
        reads: Vec<AttributeId>,
        writes: Vec<AttributeId>,
    }

    impl RecordingTask {
        pub(crate) fn new(
            name: &'static str,
            trace: Attr<Vec<&'static str>>,
            reads: Vec<AttributeId>,
            writes: Vec<AttributeId>,
        ) -> Self {
            Self {
                name,
                trace,
                reads,
                writes,
            }
        }
    }

    impl Task for RecordingTask {
        fn name(&self) -> &str {
            self.name
        }
        fn attribute_dependencies(&self) -> Vec<AttributeId> {
            self.reads.clone()
        }
        fn modified_attributes(&self) -> Vec<AttributeId> {
            let mut writes = self.writes.clone();
            writes.push(self.trace.id());
            writes
        }
        fn execute(&self, _time: f64, _step_count: usize) {
            self.trace.write().push(self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeArena;

    struct DeclTask {
        name: String,
        reads: Vec<AttributeId>,
        writes: Vec<AttributeId>,
    }

    impl Task for DeclTask {
        fn name(&self) -> &str {
            &self.name
        }
        fn attribute_dependencies(&self) -> Vec<AttributeId> {
            self.reads.clone()
        }
        fn modified_attributes(&self) -> Vec<AttributeId> {
            self.writes.clone()
        }
        fn execute(&self, _time: f64, _step_count: usize) {}
    }

    fn task(
        arena: &mut AttributeArena,
        name: &str,
        reads: &[&str],
        writes: &[&str],
    ) -> Arc<dyn Task> {
        Arc::new(DeclTask {
            name: name.to_owned(),
            reads: reads.iter().map(|a| arena.intern(a)).collect(),
            writes: writes.iter().map(|a| arena.intern(a)).collect(),
        })
    }

    #[test]
    fn resolver_emits_writer_to_reader_edges() {
        let mut arena = AttributeArena::new();
        let tasks = vec![
            task(&mut arena, "pre", &[], &["rhs"]),
            task(&mut arena, "solve", &["rhs"], &["left"]),
            task(&mut arena, "post", &["left"], &[]),
        ];
        let (in_edges, out_edges) = resolve_dependencies(&tasks);
        assert!(in_edges[&1].contains(&0));
        assert!(in_edges[&2].contains(&1));
        assert!(out_edges[&0].contains(&1));
        assert!(in_edges[&0].is_empty());
    }

    #[test]
    fn previous_step_reads_produce_no_edges() {
        struct PrevTask {
            id: AttributeId,
        }
        impl Task for PrevTask {
            fn name(&self) -> &str {
                "prev"
            }
            fn previous_step_dependencies(&self) -> Vec<AttributeId> {
                vec![self.id]
            }
            fn execute(&self, _: f64, _: usize) {}
        }
        let mut arena = AttributeArena::new();
        let id = arena.intern("state");
        let tasks: Vec<Arc<dyn Task>> = vec![
            task(&mut arena, "writer", &[], &["state"]),
            Arc::new(PrevTask { id }),
        ];
        let (in_edges, _) = resolve_dependencies(&tasks);
        assert!(in_edges[&1].is_empty());
    }

    #[test]
    fn toposort_respects_all_edges() {
        let mut arena = AttributeArena::new();
        let tasks = vec![
            task(&mut arena, "c", &["b"], &["c"]),
            task(&mut arena, "a", &[], &["a"]),
            task(&mut arena, "b", &["a"], &["b"]),
        ];
        let (in_edges, out_edges) = resolve_dependencies(&tasks);
        let order = topological_sort(&tasks, &in_edges, &out_edges).unwrap();
        let pos = |i: usize| order.iter().position(|&x| x == i).unwrap();
        assert!(pos(1) < pos(2));
        assert!(pos(2) < pos(0));
    }

    #[test]
    fn cycle_is_a_scheduling_error() {
        let mut arena = AttributeArena::new();
        let tasks = vec![
            task(&mut arena, "a", &["y"], &["x"]),
            task(&mut arena, "b", &["x"], &["y"]),
        ];
        let (in_edges, out_edges) = resolve_dependencies(&tasks);
        let err = topological_sort(&tasks, &in_edges, &out_edges).unwrap_err();
        match err {
            Error::Scheduling { tasks } => assert_eq!(tasks.len(), 2),
            other => panic!("expected scheduling error, got {other}"),
        }
    }

    #[test]
    fn levels_never_contain_both_edge_endpoints() {
        let mut arena = AttributeArena::new();
        let tasks = vec![
            task(&mut arena, "a", &[], &["a"]),
            task(&mut arena, "b", &[], &["b"]),
            task(&mut arena, "c", &["a", "b"], &["c"]),
            task(&mut arena, "d", &["c"], &[]),
            task(&mut arena, "e", &["a"], &[]),
        ];
        let (in_edges, out_edges) = resolve_dependencies(&tasks);
        let order = topological_sort(&tasks, &in_edges, &out_edges).unwrap();
        let levels = level_schedule(&order, &in_edges);

        let level_of = |i: usize| levels.iter().position(|l| l.contains(&i)).unwrap();
        for (reader, preds) in &in_edges {
            for pred in preds {
                assert!(
                    level_of(*pred) < level_of(*reader),
                    "edge {pred}->{reader} does not cross levels upward"
                );
            }
        }
        assert_eq!(levels[0], vec![0, 1]);
    }

    #[test]
    fn self_loops_are_discarded() {
        let mut arena = AttributeArena::new();
        let tasks = vec![task(&mut arena, "a", &["x"], &["x"])];
        let (in_edges, out_edges) = resolve_dependencies(&tasks);
        assert!(in_edges[&0].is_empty());
        assert!(topological_sort(&tasks, &in_edges, &out_edges).is_ok());
    }
}
