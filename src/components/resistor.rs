//! Linear resistor.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use num_traits::Zero;

use crate::attribute::{ArenaRef, Attr, AttributeId};
use crate::components::node::SimNode;
use crate::components::{stamp_admittance, HarmonicComponent, MnaComponent};
use crate::scheduler::{Task, TaskList};
use crate::solver::scalar::MnaScalar;

pub struct Resistor<S: MnaScalar> {
    name: String,
    subsystem: usize,
    node1: Arc<SimNode<S>>,
    node2: Arc<SimNode<S>>,
    conductance: S,
    idx1: Option<usize>,
    idx2: Option<usize>,
    left_vector: Option<Attr<DVector<S>>>,
    /// Voltage across and current through the element, `node1` to `node2`.
    v_intf: Attr<S>,
    i_intf: Attr<S>,
}

impl<S: MnaScalar> Resistor<S> {
    pub fn new(
        name: &str,
        node1: Arc<SimNode<S>>,
        node2: Arc<SimNode<S>>,
        resistance: f64,
        arena: &ArenaRef,
    ) -> Self {
        Self {
            name: name.to_owned(),
            subsystem: 0,
            node1,
            node2,
            conductance: S::from_real(1.0 / resistance),
            idx1: None,
            idx2: None,
            left_vector: None,
            v_intf: Attr::new(arena, &format!("{name}.v_intf"), S::zero()),
            i_intf: Attr::new(arena, &format!("{name}.i_intf"), S::zero()),
        }
    }

    pub fn set_subsystem(&mut self, subsystem: usize) {
        self.subsystem = subsystem;
    }

    pub fn v_intf(&self) -> &Attr<S> {
        &self.v_intf
    }

    pub fn i_intf(&self) -> &Attr<S> {
        &self.i_intf
    }
}

impl<S: MnaScalar> MnaComponent<S> for Resistor<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn mna_initialize(&mut self, _omega: f64, _dt: f64, left_vector: Attr<DVector<S>>) {
        self.left_vector = Some(left_vector);
        self.idx1 = self.node1.matrix_index(0);
        self.idx2 = self.node2.matrix_index(0);
        let v0 = S::from_phasor(
            self.node1.initial_single_voltage() - self.node2.initial_single_voltage(),
        );
        self.v_intf.set(v0);
        self.i_intf.set(self.conductance * v0);
    }

    fn apply_system_matrix_stamp(&self, m: &mut DMatrix<S>) {
        stamp_admittance(m, self.conductance, self.idx1, self.idx2);
    }

    fn tasks(&self) -> TaskList {
        // No interface updates in the per-frequency mode, where only the
        // harmonic initialization ran.
        let Some(left_vector) = self.left_vector.clone() else {
            return Vec::new();
        };
        vec![Arc::new(ResistorPostStep {
            name: format!("{}.PostStep", self.name),
            subsystem: self.subsystem,
            idx1: self.idx1,
            idx2: self.idx2,
            conductance: self.conductance,
            left_vector,
            v_intf: self.v_intf.clone(),
            i_intf: self.i_intf.clone(),
        })]
    }
}

impl<S: MnaScalar> HarmonicComponent<S> for Resistor<S> {
    fn mna_initialize_harm(
        &mut self,
        _omegas: &[f64],
        _dt: f64,
        _left_vectors: Vec<Attr<DVector<S>>>,
    ) {
        self.idx1 = self.node1.matrix_index(0);
        self.idx2 = self.node2.matrix_index(0);
    }

    fn apply_system_matrix_stamp_harm(&self, m: &mut DMatrix<S>, _freq_idx: usize) {
        stamp_admittance(m, self.conductance, self.idx1, self.idx2);
    }

    fn apply_right_side_vector_stamp_harm(&self, _v: &mut DVector<S>, _freq_idx: usize) {}
}

struct ResistorPostStep<S: MnaScalar> {
    name: String,
    subsystem: usize,
    idx1: Option<usize>,
    idx2: Option<usize>,
    conductance: S,
    left_vector: Attr<DVector<S>>,
    v_intf: Attr<S>,
    i_intf: Attr<S>,
}

impl<S: MnaScalar> Task for ResistorPostStep<S> {
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
        vec![self.v_intf.id(), self.i_intf.id()]
    }

    fn execute(&self, _time: f64, _step_count: usize) {
        let left = self.left_vector.read();
        let at = |idx: Option<usize>| idx.map_or_else(S::zero, |i| left[i]);
        let v = at(self.idx1) - at(self.idx2);
        drop(left);
        self.v_intf.set(v);
        self.i_intf.set(self.conductance * v);
    }
}
