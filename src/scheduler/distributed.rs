//! Rank-parallel executor with barrier-synchronized state exchange.
//!
//! Every rank holds the full system but owns only a subset of subsystems
//! (`subsystem s` belongs to `rank s mod R`). Per tick each rank executes its
//! owned subsystems sequentially, then all ranks exchange the tail samples of
//! the decoupling-line ring buffers over the broadcast fabric. Ranks with an
//! empty subsystem list still take part in every collective.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::error::Result;
use crate::scheduler::{
    level_schedule, topological_sort, Edges, Scheduler, Task, TaskList, TaskMeasurements,
};
use crate::transport::Transport;

/// A decoupling-line endpoint participating in the per-tick exchange.
///
/// Encode and deposit must agree on the byte layout; the sizes are fixed at
/// schedule creation so every rank can allocate identical buffers.
pub trait RingExchange: Send + Sync {
    fn subsystem(&self) -> usize;

    /// Serialized size of one tail sample in bytes.
    fn payload_size(&self) -> usize;

    /// Writes the tail sample of the locally owned end into `buf`, returning
    /// the number of bytes written.
    fn encode_tail(&self, buf: &mut [u8]) -> usize;

    /// Deposits a received tail sample into the opposite end's ring buffer,
    /// returning the number of bytes consumed.
    fn deposit_tail(&self, buf: &[u8]) -> usize;
}

/// Barrier-synchronized executor over a [`Transport`].
pub struct DistributedScheduler<T: Transport> {
    transport: T,
    exchanges: Vec<Arc<dyn RingExchange>>,
    /// `levels[subsystem][level]` holds the tasks of one level of one
    /// subsystem; indices into the original task list ride along for
    /// measurement bookkeeping.
    levels: Vec<Vec<Vec<(usize, Arc<dyn Task>)>>>,
    /// Subsystems owned per rank.
    subsystems: Vec<Vec<usize>>,
    /// Exchange payload bytes announced by each rank.
    payload_sizes: Vec<usize>,
    out_measurement_file: Option<PathBuf>,
    measurements: Option<TaskMeasurements>,
}

impl<T: Transport> DistributedScheduler<T> {
    pub fn new(transport: T, exchanges: Vec<Arc<dyn RingExchange>>) -> Self {
        Self {
            transport,
            exchanges,
            levels: Vec::new(),
            subsystems: Vec::new(),
            payload_sizes: Vec::new(),
            out_measurement_file: None,
            measurements: None,
        }
    }

    pub fn measure(mut self, path: impl Into<PathBuf>) -> Self {
        self.out_measurement_file = Some(path.into());
        self
    }

    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    /// Precomputes the serialized exchange size announced by each rank, so
    /// receivers can allocate identical buffers before the broadcast.
    fn define_payload_sizes(&mut self) {
        self.payload_sizes = self
            .subsystems
            .iter()
            .map(|owned| {
                owned
                    .iter()
                    .map(|&s| {
                        self.exchanges
                            .iter()
                            .filter(|e| e.subsystem() == s)
                            .map(|e| e.payload_size())
                            .sum::<usize>()
                    })
                    .sum()
            })
            .collect();
    }

    /// Endpoints of `rank` in subsystem-then-insertion order. Every rank
    /// iterates identically, which is what makes the wire layout agree.
    fn endpoints_of(&self, rank: usize) -> impl Iterator<Item = &Arc<dyn RingExchange>> {
        self.subsystems[rank].iter().flat_map(move |&s| {
            self.exchanges.iter().filter(move |e| e.subsystem() == s)
        })
    }

    fn execute_owned(&mut self, time: f64, step_count: usize) {
        let rank = self.transport.rank();
        for &s in &self.subsystems[rank] {
            for level in &self.levels[s] {
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
    }

    fn exchange(&self, step_count: usize) {
        let rank = self.transport.rank();
        for src in 0..self.transport.size() {
            let size = self.payload_sizes[src];
            if size == 0 {
                continue;
            }
            let mut buf = vec![0u8; size];
            if rank == src {
                let mut offset = 0;
                for endpoint in self.endpoints_of(src) {
                    offset += endpoint.encode_tail(&mut buf[offset..]);
                }
                debug_assert_eq!(offset, size);
            }
            self.transport.barrier();
            if let Err(e) = self.transport.broadcast(src, &mut buf) {
                // Collective failure leaves the fabric in an undefined state;
                // the whole job has to go down.
                panic!("fatal transport failure at step {step_count}: {e}");
            }
            self.transport.barrier();
            if rank != src {
                let mut offset = 0;
                for endpoint in self.endpoints_of(src) {
                    offset += endpoint.deposit_tail(&buf[offset..]);
                }
                debug_assert_eq!(offset, size);
            }
            self.transport.barrier();
        }
    }
}

impl<T: Transport> Scheduler for DistributedScheduler<T> {
    fn create_schedule(
        &mut self,
        tasks: TaskList,
        in_edges: &Edges,
        out_edges: &Edges,
    ) -> Result<()> {
        let ordered = topological_sort(&tasks, in_edges, out_edges)?;
        let flat_levels = level_schedule(&ordered, in_edges);

        if self.out_measurement_file.is_some() {
            self.measurements = Some(TaskMeasurements::new(&tasks));
        }

        let max_subsystem = tasks.iter().map(|t| t.subsystem()).max().unwrap_or(0);

        self.levels = vec![vec![Vec::new(); flat_levels.len()]; max_subsystem + 1];
        for (level_idx, level) in flat_levels.iter().enumerate() {
            for &task_idx in level {
                let task = &tasks[task_idx];
                self.levels[task.subsystem()][level_idx].push((task_idx, Arc::clone(task)));
            }
        }

        let ranks = self.transport.size();
        self.subsystems = vec![Vec::new(); ranks];
        for s in 0..=max_subsystem {
            self.subsystems[s % ranks].push(s);
        }

        self.define_payload_sizes();
        debug!(
            rank = self.transport.rank(),
            subsystems = ?self.subsystems[self.transport.rank()],
            payload_sizes = ?self.payload_sizes,
            "created distributed schedule"
        );
        Ok(())
    }

    fn step(&mut self, time: f64, step_count: usize) {
        self.execute_owned(time, step_count);
        self.exchange(step_count);
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
    use std::thread;

    use num_complex::Complex64;

    use crate::attribute::new_arena;
    use crate::components::decoupling_line::DecouplingLine;
    use crate::components::resistor::Resistor;
    use crate::components::sources::VoltageSource;
    use crate::scheduler::parallel::ThreadPoolScheduler;
    use crate::scheduler::resolve_dependencies;
    use crate::scheduler::sequential::SequentialScheduler;
    use crate::solver::MnaSolver;
    use crate::system::SystemTopology;
    use crate::testcases;
    use crate::transport::LocalFabric;

    fn run_to_left_vector(mut scheduler: Box<dyn Scheduler>, ticks: usize) -> Vec<Complex64> {
        let (sys, _) = testcases::rlc_series::<Complex64>();
        let mut solver = MnaSolver::new("agree", sys);
        solver.initialize(1e-4).unwrap();
        let tasks = solver.tasks();
        let (in_edges, out_edges) = resolve_dependencies(&tasks);
        scheduler.create_schedule(tasks, &in_edges, &out_edges).unwrap();
        for k in 0..ticks {
            scheduler.step(k as f64 * 1e-4, k);
        }
        scheduler.stop().unwrap();
        solver.left_vector().get().iter().copied().collect()
    }

    #[test]
    fn executors_agree_on_the_left_vector() {
        let fabric = LocalFabric::new(1);
        let sequential = run_to_left_vector(Box::new(SequentialScheduler::new()), 10);
        let threaded = run_to_left_vector(
            Box::new(ThreadPoolScheduler::new(Some(2)).unwrap()),
            10,
        );
        let distributed = run_to_left_vector(
            Box::new(DistributedScheduler::new(fabric.endpoint(0), Vec::new())),
            10,
        );

        for i in 0..sequential.len() {
            let scale = sequential[i].norm().max(1.0);
            assert!((sequential[i] - threaded[i]).norm() / scale < 1e-10);
            assert!((sequential[i] - distributed[i]).norm() / scale < 1e-10);
        }
    }

    #[test]
    fn stop_is_idempotent() {
        let fabric = LocalFabric::new(1);
        let mut sched = DistributedScheduler::new(fabric.endpoint(0), Vec::new());
        sched
            .create_schedule(Vec::new(), &Edges::new(), &Edges::new())
            .unwrap();
        assert!(sched.stop().is_ok());
        assert!(sched.stop().is_ok());
    }

    /// One rank of the two-rank decoupled system: a matched source behind a
    /// decoupling line of 1 ms delay driving a matched load.
    fn decoupled_rank(rank: usize, fabric: &Arc<LocalFabric>, ticks: usize) -> Complex64 {
        let delay = 1e-3;
        let surge = 30.0;
        let inductance = surge * delay;
        let capacitance = delay / surge;

        let arena = new_arena();
        let mut sys0 = SystemTopology::<Complex64>::with_arena("sub0", 50.0, arena.clone());
        let mut sys1 = SystemTopology::<Complex64>::with_arena("sub1", 50.0, arena.clone());

        let gnd0 = sys0.ground();
        let n_src = sys0.node("n_src", Complex64::new(0.0, 0.0));
        let n1 = sys0.node("n1", Complex64::new(0.0, 0.0));
        let mut vs = VoltageSource::new(
            "vs",
            Arc::clone(&n_src),
            Arc::clone(&gnd0),
            1.0,
            0.0,
            &arena,
        );
        vs.set_subsystem(0);
        sys0.add_component(vs);
        let mut rs = Resistor::new("rs", n_src, Arc::clone(&n1), surge, &arena);
        rs.set_subsystem(0);
        sys0.add_component(rs);

        let gnd1 = sys1.ground();
        let n2 = sys1.node("n2", Complex64::new(0.0, 0.0));
        n2.set_subsystem(1);
        let mut load = Resistor::new("load", Arc::clone(&n2), Arc::clone(&gnd1), surge, &arena);
        load.set_subsystem(1);
        let load_current = load.i_intf().clone();
        sys1.add_component(load);

        let (end1, end2) = DecouplingLine::split_pair(
            "line",
            n1,
            0,
            n2,
            1,
            &gnd0,
            0.0,
            inductance,
            capacitance,
            &arena,
        );
        sys0.add_decoupling_line(end1);
        sys1.add_decoupling_line(end2);

        let mut solver0 = MnaSolver::new("sub0", sys0);
        solver0.set_subsystem(0);
        solver0.initialize(1e-4).unwrap();
        let mut solver1 = MnaSolver::new("sub1", sys1);
        solver1.set_subsystem(1);
        solver1.initialize(1e-4).unwrap();

        let mut tasks = solver0.tasks();
        tasks.extend(solver1.tasks());
        let (in_edges, out_edges) = resolve_dependencies(&tasks);

        let mut exchanges = solver0.system().exchanges();
        exchanges.extend(solver1.system().exchanges());

        let mut sched = DistributedScheduler::new(fabric.endpoint(rank), exchanges);
        sched.create_schedule(tasks, &in_edges, &out_edges).unwrap();
        for k in 0..ticks {
            sched.step(k as f64 * 1e-4, k);
        }
        load_current.get()
    }

    #[test]
    fn two_rank_decoupled_line_lags_by_the_line_delay() {
        let fabric = LocalFabric::new(2);
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let fabric = Arc::clone(&fabric);
                thread::spawn(move || decoupled_rank(rank, &fabric, 120))
            })
            .collect();
        let currents: Vec<Complex64> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        // The load lives on rank 1; its phase lags the source by omega * tau.
        let load_current = currents[1];
        let expected_lag = 2.0 * std::f64::consts::PI * 50.0 * 1e-3;
        assert!(load_current.norm() > 1e-3, "no power reached the load");
        assert!(
            (load_current.arg() + expected_lag).abs() < 1e-6,
            "load current phase {} does not lag by {expected_lag}",
            load_current.arg()
        );
    }
}
