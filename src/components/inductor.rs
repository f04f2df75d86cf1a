//! Inductor with trapezoidal companion model.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use num_complex::Complex64;
use num_traits::Zero;

use crate::attribute::{ArenaRef, Attr, AttributeId};
use crate::components::node::SimNode;
use crate::components::{stamp_admittance, stamp_current, HarmonicComponent, MnaComponent};
use crate::scheduler::{Task, TaskList};
use crate::solver::scalar::MnaScalar;

/// Two-terminal inductance.
///
/// The companion model replaces the element by an equivalent conductance in
/// parallel with a history current source fed from last tick's interface
/// values: `i(t) = g·v(t) + i_hist`, `i_hist = b·i(t−Δt) + g·v(t−Δt)`.
pub struct Inductor<S: MnaScalar> {
    name: String,
    subsystem: usize,
    node1: Arc<SimNode<S>>,
    node2: Arc<SimNode<S>>,
    inductance: f64,
    equiv_cond: S,
    prev_curr_factor: S,
    harm_admittances: Vec<S>,
    idx1: Option<usize>,
    idx2: Option<usize>,
    left_vector: Option<Attr<DVector<S>>>,
    right_vector: Attr<DVector<S>>,
    v_intf: Attr<S>,
    i_intf: Attr<S>,
    i_hist: Attr<S>,
}

impl<S: MnaScalar> Inductor<S> {
    pub fn new(
        name: &str,
        node1: Arc<SimNode<S>>,
        node2: Arc<SimNode<S>>,
        inductance: f64,
        arena: &ArenaRef,
    ) -> Self {
        Self {
            name: name.to_owned(),
            subsystem: 0,
            node1,
            node2,
            inductance,
            equiv_cond: S::zero(),
            prev_curr_factor: S::zero(),
            harm_admittances: Vec::new(),
            idx1: None,
            idx2: None,
            left_vector: None,
            right_vector: Attr::new(arena, &format!("{name}.right_vector"), DVector::zeros(0)),
            v_intf: Attr::new(arena, &format!("{name}.v_intf"), S::zero()),
            i_intf: Attr::new(arena, &format!("{name}.i_intf"), S::zero()),
            i_hist: Attr::new(arena, &format!("{name}.i_hist"), S::zero()),
        }
    }

    pub fn set_subsystem(&mut self, subsystem: usize) {
        self.subsystem = subsystem;
    }

    pub fn i_intf(&self) -> &Attr<S> {
        &self.i_intf
    }
}

impl<S: MnaScalar> MnaComponent<S> for Inductor<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn mna_initialize(&mut self, omega: f64, dt: f64, left_vector: Attr<DVector<S>>) {
        self.idx1 = self.node1.matrix_index(0);
        self.idx2 = self.node2.matrix_index(0);
        let (g, b) = S::inductance_companion(self.inductance, omega, dt);
        self.equiv_cond = g;
        self.prev_curr_factor = b;

        let v0c = self.node1.initial_single_voltage() - self.node2.initial_single_voltage();
        let v0 = S::from_phasor(v0c);
        let i0 = if omega > 0.0 {
            S::from_phasor(v0c / Complex64::new(0.0, omega * self.inductance))
        } else {
            S::zero()
        };
        self.v_intf.set(v0);
        self.i_intf.set(i0);

        self.right_vector.set(DVector::zeros(left_vector.read().len()));
        self.left_vector = Some(left_vector);
    }

    fn right_vector(&self) -> Option<Attr<DVector<S>>> {
        Some(self.right_vector.clone())
    }

    fn apply_system_matrix_stamp(&self, m: &mut DMatrix<S>) {
        stamp_admittance(m, self.equiv_cond, self.idx1, self.idx2);
    }

    fn apply_right_side_vector_stamp(&self, v: &mut DVector<S>) {
        let i_hist = self.prev_curr_factor * self.i_intf.get() + self.equiv_cond * self.v_intf.get();
        stamp_current(v, -i_hist, self.idx1, self.idx2);
    }

    fn tasks(&self) -> TaskList {
        let Some(left_vector) = self.left_vector.clone() else {
            return Vec::new();
        };
        vec![
            Arc::new(InductorPreStep {
                name: format!("{}.PreStep", self.name),
                subsystem: self.subsystem,
                idx1: self.idx1,
                idx2: self.idx2,
                equiv_cond: self.equiv_cond,
                prev_curr_factor: self.prev_curr_factor,
                right_vector: self.right_vector.clone(),
                v_intf: self.v_intf.clone(),
                i_intf: self.i_intf.clone(),
                i_hist: self.i_hist.clone(),
            }),
            Arc::new(InductorPostStep {
                name: format!("{}.PostStep", self.name),
                subsystem: self.subsystem,
                idx1: self.idx1,
                idx2: self.idx2,
                equiv_cond: self.equiv_cond,
                left_vector,
                v_intf: self.v_intf.clone(),
                i_intf: self.i_intf.clone(),
                i_hist: self.i_hist.clone(),
            }),
        ]
    }
}

impl<S: MnaScalar> HarmonicComponent<S> for Inductor<S> {
    fn mna_initialize_harm(
        &mut self,
        omegas: &[f64],
        _dt: f64,
        _left_vectors: Vec<Attr<DVector<S>>>,
    ) {
        self.idx1 = self.node1.matrix_index(0);
        self.idx2 = self.node2.matrix_index(0);
        self.harm_admittances = omegas
            .iter()
            .map(|&w| S::inductance_admittance(self.inductance, w))
            .collect();
    }

    fn apply_system_matrix_stamp_harm(&self, m: &mut DMatrix<S>, freq_idx: usize) {
        stamp_admittance(m, self.harm_admittances[freq_idx], self.idx1, self.idx2);
    }

    fn apply_right_side_vector_stamp_harm(&self, _v: &mut DVector<S>, _freq_idx: usize) {}
}

struct InductorPreStep<S: MnaScalar> {
    name: String,
    subsystem: usize,
    idx1: Option<usize>,
    idx2: Option<usize>,
    equiv_cond: S,
    prev_curr_factor: S,
    right_vector: Attr<DVector<S>>,
    v_intf: Attr<S>,
    i_intf: Attr<S>,
    i_hist: Attr<S>,
}

impl<S: MnaScalar> Task for InductorPreStep<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn previous_step_dependencies(&self) -> Vec<AttributeId> {
        vec![self.v_intf.id(), self.i_intf.id()]
    }

    fn modified_attributes(&self) -> Vec<AttributeId> {
        vec![self.right_vector.id(), self.i_hist.id()]
    }

    fn execute(&self, _time: f64, _step_count: usize) {
        let i_hist =
            self.prev_curr_factor * self.i_intf.get() + self.equiv_cond * self.v_intf.get();
        self.i_hist.set(i_hist);
        let mut rv = self.right_vector.write();
        rv.fill(S::zero());
        stamp_current(&mut rv, -i_hist, self.idx1, self.idx2);
    }
}

struct InductorPostStep<S: MnaScalar> {
    name: String,
    subsystem: usize,
    idx1: Option<usize>,
    idx2: Option<usize>,
    equiv_cond: S,
    left_vector: Attr<DVector<S>>,
    v_intf: Attr<S>,
    i_intf: Attr<S>,
    i_hist: Attr<S>,
}

impl<S: MnaScalar> Task for InductorPostStep<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn attribute_dependencies(&self) -> Vec<AttributeId> {
        vec![self.left_vector.id(), self.i_hist.id()]
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
        self.i_intf.set(self.equiv_cond * v + self.i_hist.get());
    }
}
