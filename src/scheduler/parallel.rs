//! Level-synchronous thread-parallel executor.
//!
//! Fork-join with one barrier per level: every task of the current level is
//! executed on a static chunk partition of the worker pool, and the pool
//! joins before the next level starts. Tasks are assumed finite and
//! non-blocking, so there is no cancellation path.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::scheduler::{level_schedule, topological_sort, Edges, Scheduler, Task, TaskList};

/// Step phases tracked by the per-thread measurement buffers.
const PHASES: [&str; 3] = ["PreStep", "Solve", "PostStep"];

/// Per-tick, per-thread, per-phase nanosecond accumulators.
///
/// Pre-sized to the expected tick count and grown on demand, so long runs do
/// not reallocate in the middle of a measurement.
#[derive(Debug)]
struct PhaseTimes {
    threads: usize,
    /// `times[tick][thread][phase]`
    times: Vec<Vec<[u64; 3]>>,
    /// Wall time of the whole tick.
    overall: Vec<u64>,
}

impl PhaseTimes {
    fn new(threads: usize, expected_ticks: usize) -> Self {
        Self {
            threads,
            times: Vec::with_capacity(expected_ticks),
            overall: Vec::with_capacity(expected_ticks),
        }
    }

    fn push_tick(&mut self, per_thread: Vec<[u64; 3]>, overall: u64) {
        self.times.push(per_thread);
        self.overall.push(overall);
    }

    fn write_csv(&self, path: &PathBuf) -> Result<()> {
        let mut wtr = csv::WriterBuilder::new().delimiter(b';').from_path(path)?;
        let mut header = vec!["#".to_owned()];
        for t in 0..self.threads {
            for phase in PHASES {
                header.push(format!("t{t}_{phase}"));
            }
        }
        header.push("Overall".to_owned());
        wtr.write_record(&header)?;

        for (tick, row) in self.times.iter().enumerate() {
            let mut record = vec![(tick + 1).to_string()];
            for thread in row {
                for phase in thread {
                    record.push(phase.to_string());
                }
            }
            record.push(self.overall[tick].to_string());
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Fork-join executor over a rayon worker pool.
pub struct ThreadPoolScheduler {
    pool: rayon::ThreadPool,
    threads: usize,
    levels: Vec<Vec<Arc<dyn Task>>>,
    out_measurement_file: Option<PathBuf>,
    phase_times: Option<PhaseTimes>,
    expected_ticks: usize,
}

impl ThreadPoolScheduler {
    /// `threads = None` uses the process-wide worker count.
    pub fn new(threads: Option<usize>) -> Result<Self> {
        let threads = threads.unwrap_or_else(rayon::current_num_threads);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            pool,
            threads,
            levels: Vec::new(),
            out_measurement_file: None,
            phase_times: None,
            expected_ticks: 0,
        })
    }

    /// Enables the per-tick/thread/phase measurement output. `expected_ticks`
    /// pre-sizes the buffers; they still grow past it.
    pub fn measure(mut self, path: impl Into<PathBuf>, expected_ticks: usize) -> Self {
        self.out_measurement_file = Some(path.into());
        self.expected_ticks = expected_ticks;
        self
    }

    fn phase_index(name: &str) -> Option<usize> {
        PHASES.iter().position(|p| name.contains(p))
    }
}

impl Scheduler for ThreadPoolScheduler {
    fn create_schedule(
        &mut self,
        tasks: TaskList,
        in_edges: &Edges,
        out_edges: &Edges,
    ) -> Result<()> {
        let ordered = topological_sort(&tasks, in_edges, out_edges)?;
        let levels = level_schedule(&ordered, in_edges);

        if self.out_measurement_file.is_some() {
            self.phase_times = Some(PhaseTimes::new(self.threads, self.expected_ticks));
        }

        self.levels = levels
            .into_iter()
            .map(|level| level.into_iter().map(|idx| Arc::clone(&tasks[idx])).collect())
            .collect();
        Ok(())
    }

    fn step(&mut self, time: f64, step_count: usize) {
        if self.phase_times.is_none() {
            for level in &self.levels {
                let chunk = level.len().div_ceil(self.threads).max(1);
                self.pool.install(|| {
                    level
                        .par_chunks(chunk)
                        .for_each(|tasks| tasks.iter().for_each(|t| t.execute(time, step_count)));
                });
            }
            return;
        }

        let tick_start = Instant::now();
        let slots: Vec<Mutex<[u64; 3]>> = (0..self.threads).map(|_| Mutex::new([0; 3])).collect();
        for level in &self.levels {
            let chunk = level.len().div_ceil(self.threads).max(1);
            self.pool.install(|| {
                level.par_chunks(chunk).for_each(|tasks| {
                    for task in tasks {
                        let start = Instant::now();
                        task.execute(time, step_count);
                        let elapsed = start.elapsed().as_nanos() as u64;
                        if let Some(phase) = Self::phase_index(task.name()) {
                            let slot = rayon::current_thread_index().unwrap_or(0);
                            slots[slot].lock().unwrap()[phase] += elapsed;
                        }
                    }
                });
            });
        }
        let overall = tick_start.elapsed().as_nanos() as u64;
        let per_thread = slots.into_iter().map(|m| m.into_inner().unwrap()).collect();
        if let Some(times) = self.phase_times.as_mut() {
            times.push_tick(per_thread, overall);
        }
    }

    fn stop(&mut self) -> Result<()> {
        if let (Some(path), Some(times)) =
            (self.out_measurement_file.as_ref(), self.phase_times.as_ref())
        {
            times.write_csv(path)?;
        }
        self.phase_times = None;
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
    fn level_barriers_preserve_cross_level_order() {
        let arena = new_arena();
        let trace = Attr::new(&arena, "trace", Vec::<&'static str>::new());
        let a = Attr::new(&arena, "a", 0.0f64);

        // Four independent first-level tasks, one second-level reader.
        let tasks: TaskList = vec![
            Arc::new(RecordingTask::new("w1", trace.clone(), vec![], vec![a.id()])),
            Arc::new(RecordingTask::new("w2", trace.clone(), vec![], vec![a.id()])),
            Arc::new(RecordingTask::new("w3", trace.clone(), vec![], vec![a.id()])),
            Arc::new(RecordingTask::new("w4", trace.clone(), vec![], vec![a.id()])),
            Arc::new(RecordingTask::new("reader", trace.clone(), vec![a.id()], vec![])),
        ];
        let (in_edges, out_edges) = resolve_dependencies(&tasks);

        let mut sched = ThreadPoolScheduler::new(Some(2)).unwrap();
        sched.create_schedule(tasks, &in_edges, &out_edges).unwrap();
        sched.step(0.0, 0);

        let trace = trace.get();
        assert_eq!(trace.len(), 5);
        assert_eq!(*trace.last().unwrap(), "reader");
    }
}
