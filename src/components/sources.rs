//! Ideal current and voltage sources.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use num_traits::{One, Zero};

use crate::attribute::{ArenaRef, Attr, AttributeId};
use crate::components::node::SimNode;
use crate::components::{stamp_current, HarmonicComponent, MnaComponent};
use crate::error::{Error, Result};
use crate::scheduler::{Task, TaskList};
use crate::solver::scalar::MnaScalar;

/// Current source injecting into `node1` and drawing from `node2`.
///
/// Constructed either with fixed parameters, in which case its pre-step
/// refreshes `I_ref` from them every tick, or as a controlled source whose
/// `I_ref` attribute is written by another component (a decoupling line end,
/// a controller) earlier in the same tick.
pub struct CurrentSource<S: MnaScalar> {
    name: String,
    subsystem: usize,
    node1: Arc<SimNode<S>>,
    node2: Arc<SimNode<S>>,
    params: Option<(f64, f64)>,
    omega: f64,
    idx1: Option<usize>,
    idx2: Option<usize>,
    i_ref: Attr<S>,
    right_vector: Attr<DVector<S>>,
}

impl<S: MnaScalar> CurrentSource<S> {
    pub fn new(
        name: &str,
        node1: Arc<SimNode<S>>,
        node2: Arc<SimNode<S>>,
        peak: f64,
        phase: f64,
        arena: &ArenaRef,
    ) -> Self {
        Self::build(name, node1, node2, Some((peak, phase)), arena)
    }

    /// A source whose reference current is driven by another component.
    pub fn controlled(
        name: &str,
        node1: Arc<SimNode<S>>,
        node2: Arc<SimNode<S>>,
        arena: &ArenaRef,
    ) -> Self {
        Self::build(name, node1, node2, None, arena)
    }

    fn build(
        name: &str,
        node1: Arc<SimNode<S>>,
        node2: Arc<SimNode<S>>,
        params: Option<(f64, f64)>,
        arena: &ArenaRef,
    ) -> Self {
        Self {
            name: name.to_owned(),
            subsystem: 0,
            node1,
            node2,
            params,
            omega: 0.0,
            idx1: None,
            idx2: None,
            i_ref: Attr::new(arena, &format!("{name}.I_ref"), S::zero()),
            right_vector: Attr::new(arena, &format!("{name}.right_vector"), DVector::zeros(0)),
        }
    }

    pub fn set_subsystem(&mut self, subsystem: usize) {
        self.subsystem = subsystem;
    }

    pub fn i_ref(&self) -> &Attr<S> {
        &self.i_ref
    }
}

impl<S: MnaScalar> MnaComponent<S> for CurrentSource<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn mna_initialize(&mut self, omega: f64, _dt: f64, left_vector: Attr<DVector<S>>) {
        self.omega = omega;
        self.idx1 = self.node1.matrix_index(0);
        self.idx2 = self.node2.matrix_index(0);
        if let Some((peak, phase)) = self.params {
            self.i_ref.set(S::source_value(peak, phase, omega, 0.0));
        }
        self.right_vector.set(DVector::zeros(left_vector.read().len()));
    }

    fn right_vector(&self) -> Option<Attr<DVector<S>>> {
        Some(self.right_vector.clone())
    }

    fn apply_system_matrix_stamp(&self, _m: &mut DMatrix<S>) {}

    fn apply_right_side_vector_stamp(&self, v: &mut DVector<S>) {
        stamp_current(v, self.i_ref.get(), self.idx1, self.idx2);
    }

    fn tasks(&self) -> TaskList {
        vec![Arc::new(CurrentSourcePreStep {
            name: format!("{}.PreStep", self.name),
            subsystem: self.subsystem,
            idx1: self.idx1,
            idx2: self.idx2,
            params: self.params,
            omega: self.omega,
            i_ref: self.i_ref.clone(),
            right_vector: self.right_vector.clone(),
        })]
    }
}

impl<S: MnaScalar> HarmonicComponent<S> for CurrentSource<S> {
    fn mna_initialize_harm(
        &mut self,
        omegas: &[f64],
        _dt: f64,
        left_vectors: Vec<Attr<DVector<S>>>,
    ) {
        self.omega = omegas[0];
        self.idx1 = self.node1.matrix_index(0);
        self.idx2 = self.node2.matrix_index(0);
        if let Some((peak, phase)) = self.params {
            self.i_ref.set(S::source_value(peak, phase, self.omega, 0.0));
        }
        if let Some(left) = left_vectors.first() {
            self.right_vector.set(DVector::zeros(left.read().len()));
        }
    }

    fn apply_system_matrix_stamp_harm(&self, _m: &mut DMatrix<S>, _freq_idx: usize) {}

    fn apply_right_side_vector_stamp_harm(&self, v: &mut DVector<S>, _freq_idx: usize) {
        stamp_current(v, self.i_ref.get(), self.idx1, self.idx2);
    }
}

struct CurrentSourcePreStep<S: MnaScalar> {
    name: String,
    subsystem: usize,
    idx1: Option<usize>,
    idx2: Option<usize>,
    params: Option<(f64, f64)>,
    omega: f64,
    i_ref: Attr<S>,
    right_vector: Attr<DVector<S>>,
}

impl<S: MnaScalar> Task for CurrentSourcePreStep<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn attribute_dependencies(&self) -> Vec<AttributeId> {
        // A controlled source must wait for whoever drives its reference.
        if self.params.is_none() {
            vec![self.i_ref.id()]
        } else {
            Vec::new()
        }
    }

    fn modified_attributes(&self) -> Vec<AttributeId> {
        if self.params.is_some() {
            vec![self.i_ref.id(), self.right_vector.id()]
        } else {
            vec![self.right_vector.id()]
        }
    }

    fn execute(&self, time: f64, _step_count: usize) {
        if let Some((peak, phase)) = self.params {
            self.i_ref.set(S::source_value(peak, phase, self.omega, time));
        }
        let mut rv = self.right_vector.write();
        if rv.len() > 0 {
            rv.fill(S::zero());
            stamp_current(&mut rv, self.i_ref.get(), self.idx1, self.idx2);
        }
    }
}

/// Ideal voltage source with an internal virtual node carrying the branch
/// current, positive from `node1` through the source to `node2`.
pub struct VoltageSource<S: MnaScalar> {
    name: String,
    subsystem: usize,
    node1: Arc<SimNode<S>>,
    node2: Arc<SimNode<S>>,
    virtual_node: Arc<SimNode<S>>,
    peak: f64,
    phase: f64,
    omega: f64,
    idx1: Option<usize>,
    idx2: Option<usize>,
    vidx: Option<usize>,
    v_ref: Attr<S>,
    i_intf: Attr<S>,
    left_vector: Option<Attr<DVector<S>>>,
    right_vector: Attr<DVector<S>>,
}

impl<S: MnaScalar> VoltageSource<S> {
    pub fn new(
        name: &str,
        node1: Arc<SimNode<S>>,
        node2: Arc<SimNode<S>>,
        peak: f64,
        phase: f64,
        arena: &ArenaRef,
    ) -> Self {
        Self {
            name: name.to_owned(),
            subsystem: 0,
            node1,
            node2,
            virtual_node: SimNode::virtual_node(&format!("{name}.vnode"), arena),
            peak,
            phase,
            omega: 0.0,
            idx1: None,
            idx2: None,
            vidx: None,
            v_ref: Attr::new(arena, &format!("{name}.V_ref"), S::zero()),
            i_intf: Attr::new(arena, &format!("{name}.i_intf"), S::zero()),
            left_vector: None,
            right_vector: Attr::new(arena, &format!("{name}.right_vector"), DVector::zeros(0)),
        }
    }

    pub fn set_subsystem(&mut self, subsystem: usize) {
        self.subsystem = subsystem;
    }

    pub fn i_intf(&self) -> &Attr<S> {
        &self.i_intf
    }
}

impl<S: MnaScalar> MnaComponent<S> for VoltageSource<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn check_connectivity(&self) -> Result<()> {
        if self.node1.is_ground() && self.node2.is_ground() {
            return Err(Error::Config(format!(
                "voltage source {} has both terminals grounded",
                self.name
            )));
        }
        Ok(())
    }

    fn virtual_nodes(&self) -> Vec<Arc<SimNode<S>>> {
        vec![Arc::clone(&self.virtual_node)]
    }

    fn mna_initialize(&mut self, omega: f64, _dt: f64, left_vector: Attr<DVector<S>>) {
        self.omega = omega;
        self.idx1 = self.node1.matrix_index(0);
        self.idx2 = self.node2.matrix_index(0);
        self.vidx = self.virtual_node.matrix_index(0);
        self.v_ref.set(S::source_value(self.peak, self.phase, omega, 0.0));
        self.right_vector.set(DVector::zeros(left_vector.read().len()));
        self.left_vector = Some(left_vector);
    }

    fn right_vector(&self) -> Option<Attr<DVector<S>>> {
        Some(self.right_vector.clone())
    }

    fn apply_system_matrix_stamp(&self, m: &mut DMatrix<S>) {
        let vidx = self
            .vidx
            .expect("voltage source stamped before index assignment");
        if let Some(i) = self.idx1 {
            m[(vidx, i)] += S::one();
            m[(i, vidx)] += S::one();
        }
        if let Some(j) = self.idx2 {
            m[(vidx, j)] -= S::one();
            m[(j, vidx)] -= S::one();
        }
    }

    fn apply_right_side_vector_stamp(&self, v: &mut DVector<S>) {
        if let Some(vidx) = self.vidx {
            v[vidx] += self.v_ref.get();
        }
    }

    fn tasks(&self) -> TaskList {
        let Some(left_vector) = self.left_vector.clone() else {
            return Vec::new();
        };
        vec![
            Arc::new(VoltageSourcePreStep {
                name: format!("{}.PreStep", self.name),
                subsystem: self.subsystem,
                vidx: self.vidx,
                peak: self.peak,
                phase: self.phase,
                omega: self.omega,
                v_ref: self.v_ref.clone(),
                right_vector: self.right_vector.clone(),
            }),
            Arc::new(VoltageSourcePostStep {
                name: format!("{}.PostStep", self.name),
                subsystem: self.subsystem,
                vidx: self.vidx,
                left_vector,
                i_intf: self.i_intf.clone(),
            }),
        ]
    }
}

struct VoltageSourcePreStep<S: MnaScalar> {
    name: String,
    subsystem: usize,
    vidx: Option<usize>,
    peak: f64,
    phase: f64,
    omega: f64,
    v_ref: Attr<S>,
    right_vector: Attr<DVector<S>>,
}

impl<S: MnaScalar> Task for VoltageSourcePreStep<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn modified_attributes(&self) -> Vec<AttributeId> {
        vec![self.v_ref.id(), self.right_vector.id()]
    }

    fn execute(&self, time: f64, _step_count: usize) {
        let v = S::source_value(self.peak, self.phase, self.omega, time);
        self.v_ref.set(v);
        let mut rv = self.right_vector.write();
        rv.fill(S::zero());
        if let Some(vidx) = self.vidx {
            rv[vidx] += v;
        }
    }
}

struct VoltageSourcePostStep<S: MnaScalar> {
    name: String,
    subsystem: usize,
    vidx: Option<usize>,
    left_vector: Attr<DVector<S>>,
    i_intf: Attr<S>,
}

impl<S: MnaScalar> Task for VoltageSourcePostStep<S> {
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
        vec![self.i_intf.id()]
    }

    fn execute(&self, _time: f64, _step_count: usize) {
        let i = match self.vidx {
            Some(vidx) => self.left_vector.read()[vidx],
            None => S::zero(),
        };
        self.i_intf.set(i);
    }
}
