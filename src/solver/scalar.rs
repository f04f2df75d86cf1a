//! Scalar abstraction over the two solution domains.
//!
//! The solver and the component models are generic over one scalar type:
//! `f64` for EMT time-domain simulation and `Complex64` for the dynamic
//! phasor domain. Everything that genuinely differs between the domains is
//! concentrated here, mostly the companion-model coefficients of the
//! trapezoidal integration.

use nalgebra::ComplexField;
use num_complex::Complex64;

/// Solution domain tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// Electromagnetic transients, instantaneous real quantities.
    Emt,
    /// Dynamic (shifted-frequency) phasors, complex quantities.
    Dp,
}

/// Scalar of an MNA system.
pub trait MnaScalar: ComplexField<RealField = f64> + Copy + Send + Sync + 'static {
    const DOMAIN: Domain;

    /// Projects an initial phasor (from the power-flow start state) into this
    /// domain: the phasor itself for DP, its instantaneous value at t = 0 for
    /// EMT.
    fn from_phasor(v: Complex64) -> Self;

    /// Value of an ideal source with the given peak magnitude and phase at
    /// `time`.
    fn source_value(peak: f64, phase: f64, omega: f64, time: f64) -> Self;

    /// Trapezoidal companion model of an inductance: returns the equivalent
    /// conductance `g` and the previous-current factor `b` such that
    /// `i(t) = g * v(t) + b * i(t - dt) + g * v(t - dt)`.
    fn inductance_companion(l: f64, omega: f64, dt: f64) -> (Self, Self);

    /// Trapezoidal companion model of a capacitance: returns the equivalent
    /// conductance `g` and the previous-voltage factor `b` such that
    /// `i(t) = g * v(t) - b * v(t - dt) - i(t - dt)`.
    fn capacitance_companion(c: f64, omega: f64, dt: f64) -> (Self, Self);

    /// Steady-state admittance at `omega`, used for harmonic solves and
    /// ring-buffer initialization.
    fn inductance_admittance(l: f64, omega: f64) -> Self;
    fn capacitance_admittance(c: f64, omega: f64) -> Self;
}

impl MnaScalar for f64 {
    const DOMAIN: Domain = Domain::Emt;

    fn from_phasor(v: Complex64) -> Self {
        v.re
    }

    fn source_value(peak: f64, phase: f64, omega: f64, time: f64) -> Self {
        peak * (omega * time + phase).cos()
    }

    fn inductance_companion(l: f64, _omega: f64, dt: f64) -> (Self, Self) {
        (dt / (2.0 * l), 1.0)
    }

    fn capacitance_companion(c: f64, _omega: f64, dt: f64) -> (Self, Self) {
        (2.0 * c / dt, 2.0 * c / dt)
    }

    fn inductance_admittance(l: f64, omega: f64) -> Self {
        // DC limit: an inductor at omega = 0 is a short, approximated large.
        if omega == 0.0 {
            1e12
        } else {
            1.0 / (omega * l)
        }
    }

    fn capacitance_admittance(c: f64, omega: f64) -> Self {
        omega * c
    }
}

impl MnaScalar for Complex64 {
    const DOMAIN: Domain = Domain::Dp;

    fn from_phasor(v: Complex64) -> Self {
        v
    }

    fn source_value(peak: f64, phase: f64, _omega: f64, _time: f64) -> Self {
        Complex64::from_polar(peak, phase)
    }

    fn inductance_companion(l: f64, omega: f64, dt: f64) -> (Self, Self) {
        let a = Complex64::new(1.0, omega * dt / 2.0);
        (Complex64::new(dt / (2.0 * l), 0.0) / a, a.conj() / a)
    }

    fn capacitance_companion(c: f64, omega: f64, dt: f64) -> (Self, Self) {
        (
            Complex64::new(2.0 * c / dt, omega * c),
            Complex64::new(2.0 * c / dt, -omega * c),
        )
    }

    fn inductance_admittance(l: f64, omega: f64) -> Self {
        1.0 / Complex64::new(0.0, omega * l)
    }

    fn capacitance_admittance(c: f64, omega: f64) -> Self {
        Complex64::new(0.0, omega * c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emt_companion_reduces_to_textbook_trapezoidal() {
        let (g, b) = f64::inductance_companion(0.1, 314.0, 1e-4);
        assert!((g - 1e-4 / 0.2).abs() < 1e-15);
        assert_eq!(b, 1.0);
    }

    #[test]
    fn dp_companion_reduces_to_emt_at_zero_frequency() {
        let (g, b) = Complex64::inductance_companion(0.1, 0.0, 1e-4);
        let (g_emt, b_emt) = f64::inductance_companion(0.1, 0.0, 1e-4);
        assert!((g.re - g_emt).abs() < 1e-15 && g.im.abs() < 1e-15);
        assert!((b.re - b_emt).abs() < 1e-15 && b.im.abs() < 1e-15);
    }

    #[test]
    fn source_value_per_domain() {
        let dp = Complex64::source_value(2.0, 0.5, 314.0, 0.123);
        assert_eq!(dp, Complex64::from_polar(2.0, 0.5));
        let emt = f64::source_value(2.0, 0.0, 0.0, 0.0);
        assert_eq!(emt, 2.0);
    }
}
