//! Single-worker baseline executor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::error::Result;
use crate::scheduler::{
    level_schedule, topological_sort, Edges, Scheduler, Task, TaskList, TaskMeasurements,
};

/// Walks the level schedule in order, one task at a time.
///
/// If a measurement file path is set, every invocation is wrapped with a
/// monotonic-clock delta accumulated per task and flushed on [`stop`].
///
/// [`stop`]: Scheduler::stop
#[derive(Default)]
pub struct SequentialScheduler {
    levels: Vec<Vec<(usize, Arc<dyn Task>)>>,
    out_measurement_file: Option<PathBuf>,
    measurements: Option<TaskMeasurements>,
}

impl SequentialScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_measurement_file(path: impl Into<PathBuf>) -> Self {
        Self {
            out_measurement_file: Some(path.into()),
            ..Self::default()
        }
    }
}

impl Scheduler for SequentialScheduler {
    fn create_schedule(
        &mut self,
        tasks: TaskList,
        in_edges: &Edges,
        out_edges: &Edges,
    ) -> Result<()> {
        let ordered = topological_sort(&tasks, in_edges, out_edges)?;
        let levels = level_schedule(&ordered, in_edges);

        if self.out_measurement_file.is_some() {
            self.measurements = Some(TaskMeasurements::new(&tasks));
        }

        self.levels = levels
            .into_iter()
            .map(|level| {
                level
                    .into_iter()
                    .map(|idx| (idx, Arc::clone(&tasks[idx])))
                    .collect()
            })
            .collect();
        Ok(())
    }

    fn step(&mut self, time: f64, step_count: usize) {
        for level in &self.levels {
            for (idx, task) in level {
                if let Some(measurements) = self.measurements.as_mut() {
                    let start = Instant::now();
                    task.execute(time, step_count);
                    measurements.record(*idx, start.elapsed());
                } else {
                    task.execute(time, step_count);
                }
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        if let (Some(path), Some(measurements)) =
            (self.out_measurement_file.as_ref(), self.measurements.as_ref())
        {
            measurements.write_csv(path)?;
        }
        self.measurements = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{new_arena, Attr};
    use crate::scheduler::resolve_dependencies;
    use crate::scheduler::tests_support::RecordingTask;

    #[test]
    fn executes_in_dependency_order() {
        let arena = new_arena();
        let trace = Attr::new(&arena, "trace", Vec::<&'static str>::new());
        let a = Attr::new(&arena, "a", 0.0f64);
        let b = Attr::new(&arena, "b", 0.0f64);

        let tasks: TaskList = vec![
            Arc::new(RecordingTask::new("late", trace.clone(), vec![a.id(), b.id()], vec![])),
            Arc::new(RecordingTask::new("mid", trace.clone(), vec![a.id()], vec![b.id()])),
            Arc::new(RecordingTask::new("early", trace.clone(), vec![], vec![a.id()])),
        ];
        let (in_edges, out_edges) = resolve_dependencies(&tasks);

        let mut sched = SequentialScheduler::new();
        sched.create_schedule(tasks, &in_edges, &out_edges).unwrap();
        sched.step(0.0, 0);

        assert_eq!(trace.get(), vec!["early", "mid", "late"]);
    }

    #[test]
    fn cross_writing_tasks_fail_schedule_creation() {
        use crate::error::Error;

        let arena = new_arena();
        let trace = Attr::new(&arena, "trace", Vec::<&'static str>::new());
        let x = Attr::new(&arena, "x", 0.0f64);
        let y = Attr::new(&arena, "y", 0.0f64);

        // A writes X and reads Y, B writes Y and reads X.
        let tasks: TaskList = vec![
            Arc::new(RecordingTask::new("a", trace.clone(), vec![y.id()], vec![x.id()])),
            Arc::new(RecordingTask::new("b", trace.clone(), vec![x.id()], vec![y.id()])),
        ];
        let (in_edges, out_edges) = resolve_dependencies(&tasks);

        let mut sched = SequentialScheduler::new();
        match sched.create_schedule(tasks, &in_edges, &out_edges) {
            Err(Error::Scheduling { tasks }) => {
                assert!(tasks.contains(&"a".to_owned()));
                assert!(tasks.contains(&"b".to_owned()));
            }
            other => panic!("expected a scheduling error, got {other:?}"),
        }
    }
}
