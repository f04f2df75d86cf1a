//! System topology: nodes plus capability-tagged component collections.
//!
//! Components declare what they are when they are added; the solver then
//! iterates the pre-filtered collections directly instead of probing for
//! interfaces at runtime.

use std::f64::consts::PI;
use std::sync::{Arc, RwLock};

use num_complex::Complex64;

use crate::attribute::{new_arena, ArenaRef};
use crate::components::decoupling_line::DecouplingLine;
use crate::components::node::{PhaseType, SimNode};
use crate::components::{HarmonicComponent, MnaComponent, SignalComponent, SwitchComponent};
use crate::scheduler::distributed::RingExchange;
use crate::solver::scalar::MnaScalar;

pub struct SystemTopology<S: MnaScalar> {
    name: String,
    /// Fundamental frequency in Hz.
    frequency: f64,
    /// All solve frequencies; index 0 is the fundamental.
    frequencies: Vec<f64>,
    arena: ArenaRef,
    ground: Arc<SimNode<S>>,
    nodes: Vec<Arc<SimNode<S>>>,
    mna_components: Vec<Arc<RwLock<dyn MnaComponent<S>>>>,
    variable_components: Vec<Arc<RwLock<dyn MnaComponent<S>>>>,
    switches: Vec<Arc<RwLock<dyn SwitchComponent<S>>>>,
    harmonic_components: Vec<Arc<RwLock<dyn HarmonicComponent<S>>>>,
    signal_components: Vec<Arc<dyn SignalComponent>>,
    exchanges: Vec<Arc<dyn RingExchange>>,
}

impl<S: MnaScalar> SystemTopology<S> {
    pub fn new(name: &str, frequency: f64) -> Self {
        Self::with_arena(name, frequency, new_arena())
    }

    /// Several topologies can share one arena so attribute ids stay unique
    /// across partitioned subsystems.
    pub fn with_arena(name: &str, frequency: f64, arena: ArenaRef) -> Self {
        let ground = SimNode::ground(&arena);
        Self {
            name: name.to_owned(),
            frequency,
            frequencies: vec![frequency],
            arena,
            ground,
            nodes: Vec::new(),
            mna_components: Vec::new(),
            variable_components: Vec::new(),
            switches: Vec::new(),
            harmonic_components: Vec::new(),
            signal_components: Vec::new(),
            exchanges: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn omega(&self) -> f64 {
        2.0 * PI * self.frequency
    }

    /// Harmonic frequency set, fundamental first.
    pub fn set_frequencies(&mut self, frequencies: Vec<f64>) {
        self.frequencies = frequencies;
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn arena(&self) -> &ArenaRef {
        &self.arena
    }

    pub fn ground(&self) -> Arc<SimNode<S>> {
        Arc::clone(&self.ground)
    }

    /// Creates and registers a network node.
    pub fn node(&mut self, name: &str, initial_voltage: Complex64) -> Arc<SimNode<S>> {
        self.node_with_phase(name, PhaseType::Single, initial_voltage)
    }

    pub fn node_with_phase(
        &mut self,
        name: &str,
        phase: PhaseType,
        initial_voltage: Complex64,
    ) -> Arc<SimNode<S>> {
        let node = SimNode::new(name, phase, initial_voltage, &self.arena);
        self.nodes.push(Arc::clone(&node));
        node
    }

    pub fn nodes(&self) -> &[Arc<SimNode<S>>] {
        &self.nodes
    }

    /// Plain MNA component.
    pub fn add_component<C>(&mut self, component: C) -> Arc<RwLock<C>>
    where
        C: MnaComponent<S> + 'static,
    {
        let component = Arc::new(RwLock::new(component));
        self.mna_components
            .push(Arc::clone(&component) as Arc<RwLock<dyn MnaComponent<S>>>);
        component
    }

    /// MNA component whose matrix stamp can change between schedule
    /// creations.
    pub fn add_variable_component<C>(&mut self, component: C) -> Arc<RwLock<C>>
    where
        C: MnaComponent<S> + 'static,
    {
        let component = Arc::new(RwLock::new(component));
        self.mna_components
            .push(Arc::clone(&component) as Arc<RwLock<dyn MnaComponent<S>>>);
        self.variable_components
            .push(Arc::clone(&component) as Arc<RwLock<dyn MnaComponent<S>>>);
        component
    }

    /// Switch-capable component; not part of the plain MNA collection, its
    /// stamp is applied per switch-state key.
    pub fn add_switch<C>(&mut self, component: C) -> Arc<RwLock<C>>
    where
        C: SwitchComponent<S> + 'static,
    {
        let component = Arc::new(RwLock::new(component));
        self.switches
            .push(Arc::clone(&component) as Arc<RwLock<dyn SwitchComponent<S>>>);
        component
    }

    /// Component solved once per harmonic frequency; also participates in the
    /// fundamental solve.
    pub fn add_harmonic_component<C>(&mut self, component: C) -> Arc<RwLock<C>>
    where
        C: HarmonicComponent<S> + 'static,
    {
        let component = Arc::new(RwLock::new(component));
        self.mna_components
            .push(Arc::clone(&component) as Arc<RwLock<dyn MnaComponent<S>>>);
        self.harmonic_components
            .push(Arc::clone(&component) as Arc<RwLock<dyn HarmonicComponent<S>>>);
        component
    }

    pub fn add_signal_component(&mut self, component: Arc<dyn SignalComponent>) {
        self.signal_components.push(component);
    }

    pub fn mna_components(&self) -> &[Arc<RwLock<dyn MnaComponent<S>>>] {
        &self.mna_components
    }

    pub fn variable_components(&self) -> &[Arc<RwLock<dyn MnaComponent<S>>>] {
        &self.variable_components
    }

    pub fn switches(&self) -> &[Arc<RwLock<dyn SwitchComponent<S>>>] {
        &self.switches
    }

    pub fn harmonic_components(&self) -> &[Arc<RwLock<dyn HarmonicComponent<S>>>] {
        &self.harmonic_components
    }

    pub fn signal_components(&self) -> &[Arc<dyn SignalComponent>] {
        &self.signal_components
    }

    pub fn exchanges(&self) -> Vec<Arc<dyn RingExchange>> {
        self.exchanges.clone()
    }

    pub fn component_count(&self) -> usize {
        self.mna_components.len() + self.switches.len() + self.signal_components.len()
    }
}

impl SystemTopology<Complex64> {
    /// Registers a decoupling line: the line itself as a signal component and
    /// exchange endpoint, plus its electrical companion parts.
    pub fn add_decoupling_line(&mut self, line: Arc<DecouplingLine>) {
        for (res, src) in line.line_components() {
            self.mna_components
                .push(res as Arc<RwLock<dyn MnaComponent<Complex64>>>);
            self.mna_components
                .push(src as Arc<RwLock<dyn MnaComponent<Complex64>>>);
        }
        self.exchanges
            .push(Arc::clone(&line) as Arc<dyn RingExchange>);
        self.signal_components.push(line as Arc<dyn SignalComponent>);
    }
}
