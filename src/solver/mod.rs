//! MNA assembly and solve pipeline.
//!
//! The solver walks the topology once at initialization: it classifies the
//! registered components, collects virtual nodes, assigns matrix indices,
//! stamps one system matrix per switch-state key and precomputes a
//! partial-pivot LU factorization for each. Per tick a single solve task sums
//! the components' right-side stamps, selects the factorization matching the
//! current switch bitmask and publishes the left vector. In
//! frequency-parallel mode there is one independent solve task per harmonic.

pub mod linear;
pub mod scalar;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use derive_more::Deref;
use indexmap::IndexMap;
use nalgebra::{DMatrix, DVector};
use num_traits::Zero;
use tracing::{debug, info, warn};

use crate::attribute::{Attr, AttributeId};
use crate::components::node::SimNode;
use crate::components::{
    Behaviour, HarmonicComponent, MnaComponent, SignalComponent, SwitchComponent,
};
use crate::error::{Error, Result};
use crate::scheduler::sequential::SequentialScheduler;
use crate::scheduler::{resolve_dependencies, Scheduler, Task, TaskList};
use crate::system::SystemTopology;
use self::linear::Factorization;
use self::scalar::MnaScalar;

/// Compile-time upper bound on the number of switches; the switch-state key
/// is a bitmask of this width.
pub const SWITCH_NUM: usize = 64;

/// Fixed-width bitset of all switch states, indexing the precomputed matrix
/// table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deref)]
pub struct SwitchKey(pub u64);

/// Infinity norm over any scalar domain.
fn inf_norm<S: MnaScalar>(v: &DVector<S>) -> f64 {
    v.iter().fold(0.0, |acc, x| acc.max(x.modulus()))
}

/// Switch-state-keyed system matrices and their factorizations. Immutable
/// after initialization and shared lock-free with the solve tasks.
pub struct SwitchedSystem<S: MnaScalar> {
    matrices: IndexMap<SwitchKey, DMatrix<S>>,
    factorizations: IndexMap<SwitchKey, Factorization<S>>,
    harm_factorizations: IndexMap<SwitchKey, Vec<Factorization<S>>>,
}

impl<S: MnaScalar> SwitchedSystem<S> {
    pub fn matrix(&self, key: SwitchKey) -> Option<&DMatrix<S>> {
        self.matrices.get(&key)
    }

    /// Number of precomputed factorizations.
    pub fn state_count(&self) -> usize {
        self.factorizations.len().max(self.harm_factorizations.len())
    }

    fn factorization(&self, key: SwitchKey) -> &Factorization<S> {
        self.factorizations
            .get(&key)
            .expect("switch state outside the precomputed table")
    }

    fn harm_factorization(&self, key: SwitchKey, freq_idx: usize) -> &Factorization<S> {
        &self
            .harm_factorizations
            .get(&key)
            .expect("switch state outside the precomputed table")[freq_idx]
    }
}

pub struct MnaSolver<S: MnaScalar> {
    name: String,
    system: SystemTopology<S>,
    time_step: f64,
    subsystem: usize,
    frequency_parallel: bool,
    steady_state_init: bool,
    steady_state_accuracy: f64,
    steady_state_time_limit: f64,

    nodes: Vec<Arc<SimNode<S>>>,
    num_net_nodes: usize,
    num_net_matrix_node_indices: usize,
    num_matrix_node_indices: usize,
    num_harm_matrix_node_indices: usize,

    mna_components: Vec<Arc<RwLock<dyn MnaComponent<S>>>>,
    switches: Vec<Arc<RwLock<dyn SwitchComponent<S>>>>,
    harmonic_components: Vec<Arc<RwLock<dyn HarmonicComponent<S>>>>,
    signal_components: Vec<Arc<dyn SignalComponent>>,

    right_vector_stamps: Vec<Attr<DVector<S>>>,
    left_vector: Option<Attr<DVector<S>>>,
    right_vector: Option<Attr<DVector<S>>>,
    left_vector_harm: Vec<Attr<DVector<S>>>,
    switched: Option<Arc<SwitchedSystem<S>>>,
    switch_status: Arc<AtomicU64>,
}

impl<S: MnaScalar> MnaSolver<S> {
    pub fn new(name: &str, system: SystemTopology<S>) -> Self {
        Self {
            name: name.to_owned(),
            system,
            time_step: 0.0,
            subsystem: 0,
            frequency_parallel: false,
            steady_state_init: false,
            steady_state_accuracy: 1e-9,
            steady_state_time_limit: 0.1,
            nodes: Vec::new(),
            num_net_nodes: 0,
            num_net_matrix_node_indices: 0,
            num_matrix_node_indices: 0,
            num_harm_matrix_node_indices: 0,
            mna_components: Vec::new(),
            switches: Vec::new(),
            harmonic_components: Vec::new(),
            signal_components: Vec::new(),
            right_vector_stamps: Vec::new(),
            left_vector: None,
            right_vector: None,
            left_vector_harm: Vec::new(),
            switched: None,
            switch_status: Arc::new(AtomicU64::new(0)),
        }
    }

    /// One independent solve per harmonic frequency instead of a single
    /// augmented system.
    pub fn set_frequency_parallel(&mut self, enabled: bool) {
        self.frequency_parallel = enabled;
    }

    pub fn set_steady_state_init(&mut self, enabled: bool) {
        self.steady_state_init = enabled;
    }

    pub fn set_steady_state_params(&mut self, accuracy: f64, time_limit: f64) {
        self.steady_state_accuracy = accuracy;
        self.steady_state_time_limit = time_limit;
    }

    /// Subsystem tag carried by the solve tasks.
    pub fn set_subsystem(&mut self, subsystem: usize) {
        self.subsystem = subsystem;
    }

    pub fn system(&self) -> &SystemTopology<S> {
        &self.system
    }

    pub fn left_vector(&self) -> Attr<DVector<S>> {
        self.left_vector
            .clone()
            .expect("solver not initialized")
    }

    pub fn left_vector_harm(&self, freq_idx: usize) -> Attr<DVector<S>> {
        self.left_vector_harm[freq_idx].clone()
    }

    pub fn switched_system(&self) -> Arc<SwitchedSystem<S>> {
        Arc::clone(self.switched.as_ref().expect("solver not initialized"))
    }

    pub fn current_switch_status(&self) -> u64 {
        self.switch_status.load(Ordering::Relaxed)
    }

    pub fn initialize(&mut self, time_step: f64) -> Result<()> {
        info!(solver = %self.name, "start initialization");
        self.time_step = time_step;

        // LU decomposition of nothing would fail anyway, catch it early.
        if self.system.component_count() == 0 {
            return Err(Error::Config("empty component list".into()));
        }

        self.identify_topology_objects();
        self.collect_virtual_nodes();
        self.assign_matrix_node_indices()?;
        self.create_empty_vectors();
        self.initialize_components()?;

        if self.steady_state_init && !self.frequency_parallel {
            self.set_component_behaviour(Behaviour::Initialization);
            self.initialize_system()?;
            self.steady_state_initialization()?;
        }

        self.set_component_behaviour(Behaviour::Simulation);
        self.initialize_system()?;

        info!(solver = %self.name, "initialization finished");
        Ok(())
    }

    /// Walks nodes and components, keeping non-ground nodes and the
    /// capability collections declared at registration.
    fn identify_topology_objects(&mut self) {
        self.nodes = self
            .system
            .nodes()
            .iter()
            .filter(|n| !n.is_ground())
            .cloned()
            .collect();
        for node in &self.nodes {
            debug!(node = node.name(), "added node");
        }

        self.mna_components = self.system.mna_components().to_vec();
        self.switches = self.system.switches().to_vec();
        self.harmonic_components = self.system.harmonic_components().to_vec();
        self.signal_components = self.system.signal_components().to_vec();

        info!(
            mna = self.mna_components.len(),
            variable = self.system.variable_components().len(),
            switches = self.switches.len(),
            signal = self.signal_components.len(),
            "identified topology objects"
        );
    }

    /// Appends component-internal auxiliary nodes after the network nodes,
    /// descending one level into sub-components.
    fn collect_virtual_nodes(&mut self) {
        self.num_net_nodes = self.nodes.len();

        let mut virtual_nodes = Vec::new();
        for comp in &self.mna_components {
            let comp = comp.read().unwrap();
            virtual_nodes.extend(comp.virtual_nodes());
            for sub in comp.subcomponents() {
                virtual_nodes.extend(sub.read().unwrap().virtual_nodes());
            }
        }
        for node in virtual_nodes {
            debug!(node = node.name(), "collected virtual node");
            self.nodes.push(node);
        }

        info!(
            network = self.num_net_nodes,
            total = self.nodes.len(),
            "collected virtual nodes"
        );
    }

    fn assign_matrix_node_indices(&mut self) -> Result<()> {
        let mut index = 0;
        for (node_idx, node) in self.nodes.iter().enumerate() {
            for phase in 0..node.phase_type().phase_count() {
                node.set_matrix_index(phase, index);
                debug!(node = node.name(), phase, index, "assigned matrix index");
                index += 1;
            }
            if node_idx + 1 == self.num_net_nodes {
                self.num_net_matrix_node_indices = index;
            }
        }
        self.num_matrix_node_indices = index;
        if self.num_net_nodes == 0 {
            self.num_net_matrix_node_indices = 0;
        }
        self.num_harm_matrix_node_indices =
            (self.system.frequencies().len() - 1) * self.num_matrix_node_indices;

        info!(
            network = self.num_net_matrix_node_indices,
            total = self.num_matrix_node_indices,
            harmonic = self.num_harm_matrix_node_indices,
            "assigned matrix node indices"
        );
        Ok(())
    }

    fn create_empty_vectors(&mut self) {
        // Attribute names carry the solver name so several solvers sharing
        // one arena (one per subsystem in partitioned setups) get distinct
        // ids.
        let arena = self.system.arena().clone();
        let name = &self.name;
        if self.frequency_parallel {
            let n = self.num_matrix_node_indices;
            self.left_vector_harm = (0..self.system.frequencies().len())
                .map(|f| Attr::new(&arena, &format!("{name}.left_vector_{f}"), DVector::zeros(n)))
                .collect();
        } else {
            let n = self.num_matrix_node_indices + self.num_harm_matrix_node_indices;
            self.left_vector = Some(Attr::new(
                &arena,
                &format!("{name}.left_vector"),
                DVector::zeros(n),
            ));
            self.right_vector = Some(Attr::new(
                &arena,
                &format!("{name}.right_vector"),
                DVector::zeros(n),
            ));
        }
    }

    fn initialize_components(&mut self) -> Result<()> {
        let omega = self.system.omega();
        let dt = self.time_step;

        for comp in &self.mna_components {
            comp.read().unwrap().check_connectivity()?;
        }
        for switch in &self.switches {
            switch.read().unwrap().check_connectivity()?;
        }

        if self.frequency_parallel {
            let omegas: Vec<f64> = self
                .system
                .frequencies()
                .iter()
                .map(|f| 2.0 * std::f64::consts::PI * f)
                .collect();
            for comp in &self.harmonic_components {
                let mut comp = comp.write().unwrap();
                comp.mna_initialize_harm(&omegas, dt, self.left_vector_harm.clone());
                if let Some(stamp) = comp.right_vector() {
                    self.right_vector_stamps.push(stamp);
                }
            }
            for switch in &self.switches {
                switch
                    .write()
                    .unwrap()
                    .mna_initialize(omega, dt, self.left_vector_harm[0].clone());
            }
        } else {
            let left = self.left_vector();
            for comp in &self.mna_components {
                let mut comp = comp.write().unwrap();
                comp.mna_initialize(omega, dt, left.clone());
                if let Some(stamp) = comp.right_vector() {
                    if stamp.read().len() != 0 {
                        self.right_vector_stamps.push(stamp);
                    }
                }
            }
            for switch in &self.switches {
                switch.write().unwrap().mna_initialize(omega, dt, left.clone());
            }
        }

        for comp in &self.signal_components {
            comp.initialize(omega, dt)?;
        }
        Ok(())
    }

    fn set_component_behaviour(&self, behaviour: Behaviour) {
        for comp in &self.mna_components {
            comp.write().unwrap().set_behaviour(behaviour);
        }
        for switch in &self.switches {
            switch.write().unwrap().set_behaviour(behaviour);
        }
        for comp in &self.signal_components {
            comp.set_behaviour(behaviour);
        }
    }

    /// Builds one system matrix and factorization per switch-state key; per
    /// frequency index in frequency-parallel mode.
    fn initialize_system(&mut self) -> Result<()> {
        if self.switches.len() > SWITCH_NUM {
            return Err(Error::Capacity(format!(
                "{} switches exceed the static bound of {SWITCH_NUM}",
                self.switches.len()
            )));
        }

        let num_keys: u64 = 1 << self.switches.len();
        let mut matrices = IndexMap::new();
        let mut factorizations = IndexMap::new();
        let mut harm_factorizations = IndexMap::new();

        if self.frequency_parallel {
            let n = self.num_matrix_node_indices;
            let freq_count = self.system.frequencies().len();
            for key in 0..num_keys {
                let mut per_freq = Vec::with_capacity(freq_count);
                for f in 0..freq_count {
                    let mut m = DMatrix::zeros(n, n);
                    for comp in &self.harmonic_components {
                        comp.read().unwrap().apply_system_matrix_stamp_harm(&mut m, f);
                    }
                    for (bit, switch) in self.switches.iter().enumerate() {
                        switch
                            .read()
                            .unwrap()
                            .apply_switch_system_matrix_stamp(&mut m, key & (1 << bit) != 0);
                    }
                    per_freq.push(
                        Factorization::compute(m)
                            .ok_or(Error::SingularMatrix { key })?,
                    );
                }
                harm_factorizations.insert(SwitchKey(key), per_freq);
            }
        } else {
            for key in 0..num_keys {
                let m = self.stamp_system_matrix(key);
                factorizations.insert(
                    SwitchKey(key),
                    Factorization::compute(m.clone()).ok_or(Error::SingularMatrix { key })?,
                );
                matrices.insert(SwitchKey(key), m);
            }
            self.update_switch_status();

            // Source vector snapshot, useful when chasing a bad first solve.
            let len = self.left_vector().read().len();
            let mut init_rhs = DVector::zeros(len);
            for comp in &self.mna_components {
                comp.read().unwrap().apply_right_side_vector_stamp(&mut init_rhs);
            }
            debug!(norm = inf_norm(&init_rhs), "initial source vector stamped");
        }

        self.switched = Some(Arc::new(SwitchedSystem {
            matrices,
            factorizations,
            harm_factorizations,
        }));
        Ok(())
    }

    fn stamp_system_matrix(&self, key: u64) -> DMatrix<S> {
        let n = self.num_matrix_node_indices;
        let total = n + self.num_harm_matrix_node_indices;
        let mut m = DMatrix::zeros(total, total);

        if self.num_harm_matrix_node_indices == 0 {
            for comp in &self.mna_components {
                comp.read().unwrap().apply_system_matrix_stamp(&mut m);
            }
        } else {
            // Augmented harmonic system: one diagonal block per frequency.
            for f in 0..self.system.frequencies().len() {
                let offset = f * n;
                let mut block = DMatrix::zeros(n, n);
                for comp in &self.harmonic_components {
                    comp.read().unwrap().apply_system_matrix_stamp_harm(&mut block, f);
                }
                for i in 0..n {
                    for j in 0..n {
                        m[(offset + i, offset + j)] += block[(i, j)];
                    }
                }
            }
        }

        for (bit, switch) in self.switches.iter().enumerate() {
            switch
                .read()
                .unwrap()
                .apply_switch_system_matrix_stamp(&mut m, key & (1 << bit) != 0);
        }
        m
    }

    /// Reads every switch's state into the current bitmask.
    fn update_switch_status(&self) {
        let mut mask = 0u64;
        for (bit, switch) in self.switches.iter().enumerate() {
            if switch.read().unwrap().is_closed() {
                mask |= 1 << bit;
            }
        }
        self.switch_status.store(mask, Ordering::Relaxed);
    }

    /// Fixed-point iteration of the solver until the left vector stops
    /// changing, used to start dynamic simulation from steady state.
    fn steady_state_initialization(&mut self) -> Result<()> {
        info!(solver = %self.name, "run steady-state initialization");

        let tasks = self.tasks();
        let (in_edges, out_edges) = resolve_dependencies(&tasks);
        let mut scheduler = SequentialScheduler::new();
        scheduler.create_schedule(tasks, &in_edges, &out_edges)?;

        let left = self.left_vector();
        let mut prev = left.get();
        let mut time = 0.0;
        let mut step_count = 0usize;
        let mut max_diff = 1.0;
        let mut max = 1.0;

        while time < self.steady_state_time_limit {
            scheduler.step(time, step_count);
            time += self.time_step;
            step_count += 1;

            let curr = left.get();
            max_diff = inf_norm(&(&prev - &curr));
            max = inf_norm(&curr);
            prev = curr;
            if max > 0.0 && max_diff / max < self.steady_state_accuracy {
                break;
            }
        }

        if time >= self.steady_state_time_limit {
            warn!(
                max_diff,
                relative = max_diff / max,
                "steady-state initialization did not converge before the time limit"
            );
        } else {
            info!(
                iterations = step_count,
                max_diff, "steady-state initialization converged"
            );
        }
        Ok(())
    }

    /// Full task list of one simulation step, solve task(s) included.
    pub fn tasks(&self) -> TaskList {
        let mut tasks = TaskList::new();

        for comp in &self.mna_components {
            tasks.extend(comp.read().unwrap().tasks());
        }
        for switch in &self.switches {
            tasks.extend(switch.read().unwrap().tasks());
        }
        for comp in &self.signal_components {
            tasks.extend(comp.tasks());
        }

        if self.frequency_parallel {
            for f in 0..self.system.frequencies().len() {
                tasks.push(Arc::new(HarmSolveTask {
                    name: format!("{}.SolveHarm{f}", self.name),
                    subsystem: self.subsystem,
                    freq_idx: f,
                    stamp_ids: self.right_vector_stamps.iter().map(Attr::id).collect(),
                    components: self.harmonic_components.clone(),
                    switches: self.switches.clone(),
                    switched: self.switched_system(),
                    left_vector: self.left_vector_harm[f].clone(),
                    right_vector: RwLock::new(DVector::zeros(self.num_matrix_node_indices)),
                }));
            }
        } else {
            for node in &self.nodes {
                tasks.push(node.post_step_task(self.left_vector()));
            }
            tasks.push(Arc::new(SolveTask {
                name: format!("{}.Solve", self.name),
                subsystem: self.subsystem,
                stamps: self.right_vector_stamps.clone(),
                switches: self.switches.clone(),
                switched: self.switched_system(),
                switch_status: Arc::clone(&self.switch_status),
                left_vector: self.left_vector(),
                right_vector: self.right_vector.clone().expect("solver not initialized"),
            }));
        }

        tasks
    }
}

/// Per-tick linear solve: accumulate stamps, select the factorization for
/// the current switch state, publish the left vector.
struct SolveTask<S: MnaScalar> {
    name: String,
    subsystem: usize,
    stamps: Vec<Attr<DVector<S>>>,
    switches: Vec<Arc<RwLock<dyn SwitchComponent<S>>>>,
    switched: Arc<SwitchedSystem<S>>,
    switch_status: Arc<AtomicU64>,
    left_vector: Attr<DVector<S>>,
    right_vector: Attr<DVector<S>>,
}

impl<S: MnaScalar> Task for SolveTask<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn attribute_dependencies(&self) -> Vec<AttributeId> {
        self.stamps.iter().map(Attr::id).collect()
    }

    fn modified_attributes(&self) -> Vec<AttributeId> {
        vec![self.left_vector.id(), self.right_vector.id()]
    }

    fn execute(&self, _time: f64, _step_count: usize) {
        let mut mask = 0u64;
        for (bit, switch) in self.switches.iter().enumerate() {
            if switch.read().unwrap().is_closed() {
                mask |= 1 << bit;
            }
        }
        self.switch_status.store(mask, Ordering::Relaxed);

        let mut rhs = self.right_vector.write();
        rhs.fill(S::zero());
        for stamp in &self.stamps {
            *rhs += &*stamp.read();
        }
        let x = self.switched.factorization(SwitchKey(mask)).solve(&rhs);
        drop(rhs);
        self.left_vector.set(x);
    }
}

/// Independent solve of one harmonic frequency.
struct HarmSolveTask<S: MnaScalar> {
    name: String,
    subsystem: usize,
    freq_idx: usize,
    stamp_ids: Vec<AttributeId>,
    components: Vec<Arc<RwLock<dyn HarmonicComponent<S>>>>,
    switches: Vec<Arc<RwLock<dyn SwitchComponent<S>>>>,
    switched: Arc<SwitchedSystem<S>>,
    left_vector: Attr<DVector<S>>,
    right_vector: RwLock<DVector<S>>,
}

impl<S: MnaScalar> Task for HarmSolveTask<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn attribute_dependencies(&self) -> Vec<AttributeId> {
        self.stamp_ids.clone()
    }

    fn modified_attributes(&self) -> Vec<AttributeId> {
        vec![self.left_vector.id()]
    }

    fn execute(&self, _time: f64, _step_count: usize) {
        let mut mask = 0u64;
        for (bit, switch) in self.switches.iter().enumerate() {
            if switch.read().unwrap().is_closed() {
                mask |= 1 << bit;
            }
        }

        let mut rhs = self.right_vector.write().unwrap();
        rhs.fill(S::zero());
        for comp in &self.components {
            comp.read()
                .unwrap()
                .apply_right_side_vector_stamp_harm(&mut rhs, self.freq_idx);
        }
        let x = self
            .switched
            .harm_factorization(SwitchKey(mask), self.freq_idx)
            .solve(&rhs);
        drop(rhs);
        self.left_vector.set(x);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64;

    use crate::scheduler::sequential::SequentialScheduler;
    use crate::testcases;

    fn run_sequential<S: MnaScalar>(solver: &MnaSolver<S>, ticks: usize, dt: f64) {
        let tasks = solver.tasks();
        let (in_edges, out_edges) = resolve_dependencies(&tasks);
        let mut sched = SequentialScheduler::new();
        sched.create_schedule(tasks, &in_edges, &out_edges).unwrap();
        for k in 0..ticks {
            sched.step(k as f64 * dt, k);
        }
    }

    #[test]
    fn empty_component_list_is_a_config_error() {
        let sys = crate::system::SystemTopology::<f64>::new("empty", 50.0);
        let mut solver = MnaSolver::new("empty", sys);
        assert!(matches!(
            solver.initialize(1e-4),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn harmonic_frequencies_solve_independently() {
        let sys = testcases::harmonic_rl();
        let frequencies = sys.frequencies().to_vec();
        let mut solver = MnaSolver::new("harm", sys);
        solver.set_frequency_parallel(true);
        solver.initialize(1e-4).unwrap();
        run_sequential(&solver, 2, 1e-4);

        for (f, freq) in frequencies.iter().enumerate() {
            let omega = 2.0 * std::f64::consts::PI * freq;
            let admittance = Complex64::new(0.1, 0.0) + 1.0 / Complex64::new(0.0, omega * 0.01);
            let expected = Complex64::new(1.0, 0.0) / admittance;
            let got = solver.left_vector_harm(f).get()[0];
            assert!(
                (got - expected).norm() / expected.norm() < 1e-12,
                "frequency {freq} diverges: {got} vs {expected}"
            );
        }
    }

    #[test]
    fn steady_state_init_reaches_the_phasor_solution() {
        let (sys, cap_node) = testcases::rlc_series::<Complex64>();
        let omega = sys.omega();
        let mut solver = MnaSolver::new("rlc", sys);
        solver.set_steady_state_init(true);
        // 500 iterations at dt = 1e-4.
        solver.set_steady_state_params(1e-9, 0.05);
        solver.initialize(1e-4).unwrap();

        let z = Complex64::new(20.0, omega * 0.01) + 1.0 / Complex64::new(0.0, omega * 1e-4);
        let i = Complex64::new(1.0, 0.0) / z;
        let expected = i / Complex64::new(0.0, omega * 1e-4);

        let idx = cap_node.matrix_index(0).unwrap();
        let got = solver.left_vector().get()[idx];
        assert!(
            (got - expected).norm() / expected.norm() < 1e-6,
            "steady state diverges: {got} vs {expected}"
        );
    }
}
