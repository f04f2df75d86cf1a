//! Network nodes.

use std::sync::{Arc, RwLock};

use nalgebra::DVector;
use num_complex::Complex64;
use num_traits::Zero;

use crate::attribute::{ArenaRef, Attr, AttributeId};
use crate::scheduler::Task;
use crate::solver::scalar::MnaScalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseType {
    Single,
    Abc,
}

impl PhaseType {
    pub fn phase_count(self) -> usize {
        match self {
            PhaseType::Single => 1,
            PhaseType::Abc => 3,
        }
    }
}

/// A node of the electrical network.
///
/// Matrix indices are assigned by the solver during initialization; ground
/// nodes never receive one. The solved voltage is published through the `v`
/// attribute by this node's post-step task.
pub struct SimNode<S: MnaScalar> {
    name: String,
    is_ground: bool,
    phase: PhaseType,
    initial_voltage: Complex64,
    subsystem: RwLock<usize>,
    indices: RwLock<[Option<usize>; 3]>,
    voltage: Attr<S>,
}

impl<S: MnaScalar> SimNode<S> {
    pub fn new(
        name: &str,
        phase: PhaseType,
        initial_voltage: Complex64,
        arena: &ArenaRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            is_ground: false,
            phase,
            initial_voltage,
            subsystem: RwLock::new(0),
            indices: RwLock::new([None; 3]),
            voltage: Attr::new(arena, &format!("{name}.v"), S::zero()),
        })
    }

    /// The shared ground reference. Never gets a matrix index.
    pub fn ground(arena: &ArenaRef) -> Arc<Self> {
        Arc::new(Self {
            name: "gnd".to_owned(),
            is_ground: true,
            phase: PhaseType::Single,
            initial_voltage: Complex64::new(0.0, 0.0),
            subsystem: RwLock::new(0),
            indices: RwLock::new([None; 3]),
            voltage: Attr::new(arena, "gnd.v", S::zero()),
        })
    }

    /// An internal auxiliary node of a component, placed after the network
    /// nodes during index assignment.
    pub fn virtual_node(name: &str, arena: &ArenaRef) -> Arc<Self> {
        Self::new(name, PhaseType::Single, Complex64::new(0.0, 0.0), arena)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ground(&self) -> bool {
        self.is_ground
    }

    pub fn phase_type(&self) -> PhaseType {
        self.phase
    }

    pub fn initial_single_voltage(&self) -> Complex64 {
        self.initial_voltage
    }

    pub fn subsystem(&self) -> usize {
        *self.subsystem.read().unwrap()
    }

    pub fn set_subsystem(&self, subsystem: usize) {
        *self.subsystem.write().unwrap() = subsystem;
    }

    pub fn matrix_index(&self, phase: usize) -> Option<usize> {
        self.indices.read().unwrap()[phase]
    }

    pub fn set_matrix_index(&self, phase: usize, index: usize) {
        self.indices.write().unwrap()[phase] = Some(index);
    }

    pub fn voltage(&self) -> &Attr<S> {
        &self.voltage
    }

    /// Post-step task publishing the solved phase-A voltage.
    pub fn post_step_task(self: &Arc<Self>, left_vector: Attr<DVector<S>>) -> Arc<dyn Task> {
        Arc::new(NodePostStep {
            name: format!("{}.PostStep", self.name),
            subsystem: self.subsystem(),
            index: self.matrix_index(0),
            left_vector,
            voltage: self.voltage.clone(),
        })
    }
}

struct NodePostStep<S: MnaScalar> {
    name: String,
    subsystem: usize,
    index: Option<usize>,
    left_vector: Attr<DVector<S>>,
    voltage: Attr<S>,
}

impl<S: MnaScalar> Task for NodePostStep<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn attribute_dependencies(&self) -> Vec<AttributeId> {
        vec![self.left_vector.id()]
    }

    fn modified_attributes(&self) -> Vec<AttributeId> {
        vec![self.voltage.id()]
    }

    fn execute(&self, _time: f64, _step_count: usize) {
        let v = match self.index {
            Some(i) => self.left_vector.read()[i],
            None => S::zero(),
        };
        self.voltage.set(v);
    }
}
