//! Component models and the capability traits the solver consumes.
//!
//! Components declare the capability set they satisfy at registration time
//! (see [`crate::system::SystemTopology`]); the solver then iterates
//! pre-filtered collections instead of probing types at runtime.

pub mod capacitor;
pub mod decoupling_line;
pub mod inductor;
pub mod node;
pub mod resistor;
pub mod sources;
pub mod switch;

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::attribute::Attr;
use crate::error::Result;
use crate::scheduler::TaskList;
use crate::solver::scalar::MnaScalar;
use self::node::SimNode;

/// Some components behave differently while the steady-state fixed point is
/// being computed; the solver flips every component to `Simulation` once
/// initialization is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Initialization,
    Simulation,
}

/// Contract between the solver and every MNA-capable component.
pub trait MnaComponent<S: MnaScalar>: Send + Sync {
    fn name(&self) -> &str;

    fn subsystem(&self) -> usize {
        0
    }

    fn set_behaviour(&mut self, _behaviour: Behaviour) {}

    /// Validates terminal connectivity before initialization.
    fn check_connectivity(&self) -> Result<()> {
        Ok(())
    }

    /// Internal auxiliary nodes to be appended to the node list.
    fn virtual_nodes(&self) -> Vec<Arc<SimNode<S>>> {
        Vec::new()
    }

    /// Sub-components whose virtual nodes must be collected as well; the
    /// solver descends one level.
    fn subcomponents(&self) -> Vec<Arc<std::sync::RwLock<dyn MnaComponent<S>>>> {
        Vec::new()
    }

    /// Computes companion-model coefficients and the start state. Matrix node
    /// indices have been assigned at this point; `left_vector` is the sized
    /// solution handle.
    fn mna_initialize(&mut self, omega: f64, dt: f64, left_vector: Attr<DVector<S>>);

    /// Handle to this component's per-tick right-side contribution, if any.
    fn right_vector(&self) -> Option<Attr<DVector<S>>> {
        None
    }

    fn apply_system_matrix_stamp(&self, m: &mut DMatrix<S>);

    /// Initialization-time stamp of the source vector, for logging only.
    fn apply_right_side_vector_stamp(&self, _v: &mut DVector<S>) {}

    fn tasks(&self) -> TaskList {
        Vec::new()
    }
}

/// Switch-capable components select between precomputed system matrices.
pub trait SwitchComponent<S: MnaScalar>: MnaComponent<S> {
    fn is_closed(&self) -> bool;

    /// Stamps the matrix for an assumed open/closed state, independent of the
    /// current one.
    fn apply_switch_system_matrix_stamp(&self, m: &mut DMatrix<S>, closed: bool);
}

/// Components that can be solved once per harmonic frequency.
pub trait HarmonicComponent<S: MnaScalar>: MnaComponent<S> {
    fn mna_initialize_harm(
        &mut self,
        omegas: &[f64],
        dt: f64,
        left_vectors: Vec<Attr<DVector<S>>>,
    );

    fn apply_system_matrix_stamp_harm(&self, m: &mut DMatrix<S>, freq_idx: usize);

    fn apply_right_side_vector_stamp_harm(&self, v: &mut DVector<S>, freq_idx: usize);
}

/// Non-electrical components that only contribute tasks (controllers,
/// decoupling lines).
pub trait SignalComponent: Send + Sync {
    fn name(&self) -> &str;

    fn subsystem(&self) -> usize {
        0
    }

    fn set_behaviour(&self, _behaviour: Behaviour) {}

    fn initialize(&self, omega: f64, dt: f64) -> Result<()>;

    fn tasks(&self) -> TaskList;
}

/// Adds a two-terminal admittance stamp, skipping grounded terminals.
pub fn stamp_admittance<S: MnaScalar>(
    m: &mut DMatrix<S>,
    g: S,
    i: Option<usize>,
    j: Option<usize>,
) {
    if let Some(i) = i {
        m[(i, i)] += g;
    }
    if let Some(j) = j {
        m[(j, j)] += g;
    }
    if let (Some(i), Some(j)) = (i, j) {
        m[(i, j)] -= g;
        m[(j, i)] -= g;
    }
}

/// Adds a current injection flowing into `i` and out of `j`.
pub fn stamp_current<S: MnaScalar>(
    v: &mut DVector<S>,
    cur: S,
    i: Option<usize>,
    j: Option<usize>,
) {
    if let Some(i) = i {
        v[i] += cur;
    }
    if let Some(j) = j {
        v[j] -= cur;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::DMatrix;

    #[test]
    fn admittance_stamp_skips_ground() {
        let mut m = DMatrix::<f64>::zeros(2, 2);
        stamp_admittance(&mut m, 0.5, Some(0), None);
        stamp_admittance(&mut m, 2.0, Some(0), Some(1));
        assert_eq!(m[(0, 0)], 2.5);
        assert_eq!(m[(1, 1)], 2.0);
        assert_eq!(m[(0, 1)], -2.0);
        assert_eq!(m[(1, 0)], -2.0);
    }

    #[test]
    fn current_stamp_signs() {
        let mut v = DVector::<f64>::zeros(2);
        stamp_current(&mut v, 1.5, Some(1), Some(0));
        assert_eq!(v[1], 1.5);
        assert_eq!(v[0], -1.5);
    }
}
