//! Traveling-wave decoupling line.
//!
//! Breaks the simultaneous-equation coupling between two subnetworks by
//! replacing the line with a delay element: at each end a surge-impedance
//! resistor in parallel with a controlled current source, fed from voltage
//! and current history kept in ring buffers of length `ceil(delay / dt)`.
//! In the shared-node form one object carries both ends; in the split form
//! the two ends are separate objects, each in its own subsystem, linked
//! pairwise and synchronized by the distributed executor exchanging ring
//! tails every tick.

use std::sync::{Arc, RwLock, Weak};

use num_complex::Complex64;
use tracing::info;

use crate::attribute::{ArenaRef, Attr, AttributeId};
use crate::components::node::SimNode;
use crate::components::resistor::Resistor;
use crate::components::sources::CurrentSource;
use crate::components::{Behaviour, SignalComponent};
use crate::error::{Error, Result};
use crate::scheduler::distributed::RingExchange;
use crate::scheduler::{Task, TaskList};

struct Ring {
    volt1: Vec<Complex64>,
    volt2: Vec<Complex64>,
    cur1: Vec<Complex64>,
    cur2: Vec<Complex64>,
    head: usize,
    size: usize,
    alpha: f64,
    omega: f64,
}

impl Ring {
    /// Linear interpolation between the two oldest samples.
    fn interpolate(&self, data: &[Complex64]) -> Complex64 {
        let c1 = data[self.head];
        let c2 = if self.head == self.size - 1 {
            data[0]
        } else {
            data[self.head + 1]
        };
        self.alpha * c1 + (1.0 - self.alpha) * c2
    }

    fn tail(&self) -> usize {
        (self.head + self.size - 1) % self.size
    }
}

pub struct DecouplingLine {
    name: String,
    subsystem: usize,
    split: bool,
    resistance: f64,
    inductance: f64,
    capacitance: f64,
    surge_impedance: f64,
    delay: f64,
    node1: Arc<SimNode<Complex64>>,
    node2: Option<Arc<SimNode<Complex64>>>,
    res1: Arc<RwLock<Resistor<Complex64>>>,
    res2: Option<Arc<RwLock<Resistor<Complex64>>>>,
    src1: Arc<RwLock<CurrentSource<Complex64>>>,
    src2: Option<Arc<RwLock<CurrentSource<Complex64>>>>,
    src_cur1: Attr<Complex64>,
    src_cur2: Option<Attr<Complex64>>,
    res1_v: Attr<Complex64>,
    res1_i: Attr<Complex64>,
    res2_v: Option<Attr<Complex64>>,
    res2_i: Option<Attr<Complex64>>,
    /// Head counter, published so post-steps order against next tick's reads.
    states: Attr<usize>,
    ring: RwLock<Option<Ring>>,
    other_end: RwLock<Weak<DecouplingLine>>,
    me: Weak<DecouplingLine>,
}

impl DecouplingLine {
    /// Shared-node form: both ends live in the same process.
    pub fn new(
        name: &str,
        node1: Arc<SimNode<Complex64>>,
        node2: Arc<SimNode<Complex64>>,
        gnd: &Arc<SimNode<Complex64>>,
        resistance: f64,
        inductance: f64,
        capacitance: f64,
        arena: &ArenaRef,
    ) -> Arc<Self> {
        Self::build(
            name,
            node1,
            Some(node2),
            gnd,
            0,
            resistance,
            inductance,
            capacitance,
            arena,
        )
    }

    /// One end of a split line, owned by `subsystem`. Use
    /// [`DecouplingLine::link`] or [`DecouplingLine::split_pair`] to connect
    /// the two halves.
    pub fn new_split(
        name: &str,
        node: Arc<SimNode<Complex64>>,
        gnd: &Arc<SimNode<Complex64>>,
        subsystem: usize,
        resistance: f64,
        inductance: f64,
        capacitance: f64,
        arena: &ArenaRef,
    ) -> Arc<Self> {
        Self::build(
            name,
            node,
            None,
            gnd,
            subsystem,
            resistance,
            inductance,
            capacitance,
            arena,
        )
    }

    /// Creates both halves of a split line and links them.
    #[allow(clippy::too_many_arguments)]
    pub fn split_pair(
        name: &str,
        node1: Arc<SimNode<Complex64>>,
        subsystem1: usize,
        node2: Arc<SimNode<Complex64>>,
        subsystem2: usize,
        gnd: &Arc<SimNode<Complex64>>,
        resistance: f64,
        inductance: f64,
        capacitance: f64,
        arena: &ArenaRef,
    ) -> (Arc<Self>, Arc<Self>) {
        let end1 = Self::new_split(
            &format!("{name}_1"),
            node1,
            gnd,
            subsystem1,
            resistance,
            inductance,
            capacitance,
            arena,
        );
        let end2 = Self::new_split(
            &format!("{name}_2"),
            node2,
            gnd,
            subsystem2,
            resistance,
            inductance,
            capacitance,
            arena,
        );
        Self::link(&end1, &end2);
        (end1, end2)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        name: &str,
        node1: Arc<SimNode<Complex64>>,
        node2: Option<Arc<SimNode<Complex64>>>,
        gnd: &Arc<SimNode<Complex64>>,
        subsystem: usize,
        resistance: f64,
        inductance: f64,
        capacitance: f64,
        arena: &ArenaRef,
    ) -> Arc<Self> {
        let split = node2.is_none();
        let surge_impedance = (inductance / capacitance).sqrt();
        let delay = (inductance * capacitance).sqrt();
        info!(line = name, surge_impedance, delay, "decoupling line parameters");

        let end_resistance = surge_impedance + resistance / 4.0;

        let mut r1 = Resistor::new(
            &format!("{name}_r1"),
            Arc::clone(&node1),
            Arc::clone(gnd),
            end_resistance,
            arena,
        );
        r1.set_subsystem(subsystem);
        let res1_v = r1.v_intf().clone();
        let res1_i = r1.i_intf().clone();

        let mut s1 = CurrentSource::controlled(
            &format!("{name}_i1"),
            Arc::clone(&node1),
            Arc::clone(gnd),
            arena,
        );
        s1.set_subsystem(subsystem);
        let src_cur1 = s1.i_ref().clone();

        let (res2, res2_v, res2_i, src2, src_cur2) = match node2.as_ref() {
            Some(node2) => {
                let mut r2 = Resistor::new(
                    &format!("{name}_r2"),
                    Arc::clone(node2),
                    Arc::clone(gnd),
                    end_resistance,
                    arena,
                );
                r2.set_subsystem(subsystem);
                let res2_v = r2.v_intf().clone();
                let res2_i = r2.i_intf().clone();
                let mut s2 = CurrentSource::controlled(
                    &format!("{name}_i2"),
                    Arc::clone(node2),
                    Arc::clone(gnd),
                    arena,
                );
                s2.set_subsystem(subsystem);
                let src_cur2 = s2.i_ref().clone();
                (
                    Some(Arc::new(RwLock::new(r2))),
                    Some(res2_v),
                    Some(res2_i),
                    Some(Arc::new(RwLock::new(s2))),
                    Some(src_cur2),
                )
            }
            None => (None, None, None, None, None),
        };

        Arc::new_cyclic(|me| Self {
            name: name.to_owned(),
            subsystem,
            split,
            resistance,
            inductance,
            capacitance,
            surge_impedance,
            delay,
            node1,
            node2,
            res1: Arc::new(RwLock::new(r1)),
            res2,
            src1: Arc::new(RwLock::new(s1)),
            src2,
            src_cur1,
            src_cur2,
            res1_v,
            res1_i,
            res2_v,
            res2_i,
            states: Attr::new(arena, &format!("{name}.states"), 0),
            ring: RwLock::new(None),
            other_end: RwLock::new(Weak::new()),
            me: me.clone(),
        })
    }

    pub fn link(end1: &Arc<Self>, end2: &Arc<Self>) {
        *end1.other_end.write().unwrap() = Arc::downgrade(end2);
        *end2.other_end.write().unwrap() = Arc::downgrade(end1);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn delay(&self) -> f64 {
        self.delay
    }

    /// The electrical companion components to register with the system.
    pub fn line_components(
        &self,
    ) -> Vec<(
        Arc<RwLock<Resistor<Complex64>>>,
        Arc<RwLock<CurrentSource<Complex64>>>,
    )> {
        let mut parts = vec![(Arc::clone(&self.res1), Arc::clone(&self.src1))];
        if let (Some(res2), Some(src2)) = (self.res2.as_ref(), self.src2.as_ref()) {
            parts.push((Arc::clone(res2), Arc::clone(src2)));
        }
        parts
    }

    fn end_resistance(&self) -> f64 {
        self.surge_impedance + self.resistance / 4.0
    }

    /// Pre-step: interpolate the delayed samples and update the source
    /// injections.
    fn step(&self, _time: f64, step_count: usize) {
        let guard = self.ring.read().unwrap();
        let Some(ring) = guard.as_ref() else {
            return;
        };
        let volt1 = ring.interpolate(&ring.volt1);
        let volt2 = ring.interpolate(&ring.volt2);
        let cur1 = ring.interpolate(&ring.cur1);
        let cur2 = ring.interpolate(&ring.cur2);

        let rk = self.end_resistance();
        let (i_src1, i_src2) = if step_count == 0 {
            // Reproduce the steady-state currents exactly on the first tick.
            (volt1 / rk - cur1, volt2 / rk - cur2)
        } else {
            let z = self.surge_impedance;
            let quarter = self.resistance / 4.0;
            let denom = rk * rk;
            let correction = Complex64::from_polar(1.0, -ring.omega * self.delay);
            let hist1 = (z * (volt2 + (z - quarter) * cur2) + quarter * (volt1 + (z - quarter) * cur1))
                / denom;
            let hist2 = (z * (volt1 + (z - quarter) * cur1) + quarter * (volt2 + (z - quarter) * cur2))
                / denom;
            (hist1 * correction, hist2 * correction)
        };
        drop(guard);

        self.src_cur1.set(i_src1);
        if let Some(src_cur2) = self.src_cur2.as_ref() {
            src_cur2.set(i_src2);
        }
    }

    #[cfg(test)]
    pub(crate) fn tail_samples(&self) -> (usize, [Complex64; 4]) {
        let guard = self.ring.read().unwrap();
        let ring = guard.as_ref().unwrap();
        let t = ring.tail();
        (t, [ring.volt1[t], ring.cur1[t], ring.volt2[t], ring.cur2[t]])
    }

    /// Post-step: record this tick's interface values and advance the head.
    fn post_step(&self) {
        let mut guard = self.ring.write().unwrap();
        let Some(ring) = guard.as_mut() else {
            return;
        };
        let head = ring.head;
        ring.volt1[head] = self.res1_v.get();
        ring.cur1[head] = self.res1_i.get() - self.src_cur1.get();
        if let (Some(res2_v), Some(res2_i), Some(src_cur2)) =
            (self.res2_v.as_ref(), self.res2_i.as_ref(), self.src_cur2.as_ref())
        {
            ring.volt2[head] = res2_v.get();
            ring.cur2[head] = res2_i.get() - src_cur2.get();
        }
        ring.head = (head + 1) % ring.size;
        self.states.set(ring.head);
    }
}

impl SignalComponent for DecouplingLine {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn set_behaviour(&self, _behaviour: Behaviour) {}

    fn initialize(&self, omega: f64, dt: f64) -> Result<()> {
        if self.delay < dt {
            return Err(Error::Capacity(format!(
                "time step {dt} larger than decoupling delay {} of {}",
                self.delay, self.name
            )));
        }

        let size = (self.delay / dt).ceil() as usize;
        let alpha = 1.0 - (size as f64 - self.delay / dt);
        info!(line = %self.name, size, alpha, "decoupling ring buffer");

        let volt1 = self.node1.initial_single_voltage();
        let volt2 = match self.node2.as_ref() {
            Some(node2) => node2.initial_single_voltage(),
            None => self.node1.initial_single_voltage(),
        };
        let series = Complex64::new(self.resistance, omega * self.inductance);
        let init_admittance = 1.0 / series + Complex64::new(0.0, omega * self.capacitance / 2.0);
        let cur1 = volt1 * init_admittance - volt2 / series;
        let cur2 = volt2 * init_admittance - volt1 / series;

        *self.ring.write().unwrap() = Some(Ring {
            volt1: vec![volt1; size],
            volt2: vec![volt2; size],
            cur1: vec![cur1; size],
            cur2: vec![cur2; size],
            head: 0,
            size,
            alpha,
            omega,
        });
        Ok(())
    }

    fn tasks(&self) -> TaskList {
        let line = self.me.upgrade().expect("decoupling line dropped");
        vec![
            Arc::new(DecouplingPreStep {
                name: format!("{}.PreStep", self.name),
                line: Arc::clone(&line),
            }),
            Arc::new(DecouplingPostStep {
                name: format!("{}.PostStep", self.name),
                line,
            }),
        ]
    }
}

struct DecouplingPreStep {
    name: String,
    line: Arc<DecouplingLine>,
}

impl Task for DecouplingPreStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.line.subsystem
    }

    fn previous_step_dependencies(&self) -> Vec<AttributeId> {
        vec![self.line.states.id()]
    }

    fn modified_attributes(&self) -> Vec<AttributeId> {
        let mut modified = vec![self.line.src_cur1.id()];
        if let Some(src_cur2) = self.line.src_cur2.as_ref() {
            modified.push(src_cur2.id());
        }
        modified
    }

    fn execute(&self, time: f64, step_count: usize) {
        self.line.step(time, step_count);
    }
}

struct DecouplingPostStep {
    name: String,
    line: Arc<DecouplingLine>,
}

impl Task for DecouplingPostStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn subsystem(&self) -> usize {
        self.line.subsystem
    }

    fn attribute_dependencies(&self) -> Vec<AttributeId> {
        let line = &self.line;
        let mut deps = vec![line.res1_v.id(), line.res1_i.id(), line.src_cur1.id()];
        if let (Some(res2_v), Some(res2_i), Some(src_cur2)) =
            (line.res2_v.as_ref(), line.res2_i.as_ref(), line.src_cur2.as_ref())
        {
            deps.extend([res2_v.id(), res2_i.id(), src_cur2.id()]);
        }
        deps
    }

    fn modified_attributes(&self) -> Vec<AttributeId> {
        vec![self.line.states.id()]
    }

    fn execute(&self, _time: f64, _step_count: usize) {
        self.line.post_step();
    }
}

const COMPLEX_WIRE_SIZE: usize = 16;
const INDEX_WIRE_SIZE: usize = 4;

fn put_complex(buf: &mut [u8], offset: usize, v: Complex64) {
    buf[offset..offset + 8].copy_from_slice(&v.re.to_le_bytes());
    buf[offset + 8..offset + 16].copy_from_slice(&v.im.to_le_bytes());
}

fn get_complex(buf: &[u8], offset: usize) -> Complex64 {
    let re = f64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
    let im = f64::from_le_bytes(buf[offset + 8..offset + 16].try_into().unwrap());
    Complex64::new(re, im)
}

impl RingExchange for DecouplingLine {
    fn subsystem(&self) -> usize {
        self.subsystem
    }

    fn payload_size(&self) -> usize {
        let samples = if self.split { 2 } else { 4 };
        INDEX_WIRE_SIZE + samples * COMPLEX_WIRE_SIZE
    }

    fn encode_tail(&self, buf: &mut [u8]) -> usize {
        let guard = self.ring.read().unwrap();
        let ring = guard.as_ref().expect("exchange before initialization");
        let tail = ring.tail();

        buf[..4].copy_from_slice(&(tail as u32).to_le_bytes());
        let mut offset = INDEX_WIRE_SIZE;
        put_complex(buf, offset, ring.volt1[tail]);
        offset += COMPLEX_WIRE_SIZE;
        put_complex(buf, offset, ring.cur1[tail]);
        offset += COMPLEX_WIRE_SIZE;
        if !self.split {
            put_complex(buf, offset, ring.volt2[tail]);
            offset += COMPLEX_WIRE_SIZE;
            put_complex(buf, offset, ring.cur2[tail]);
            offset += COMPLEX_WIRE_SIZE;
        }
        offset
    }

    fn deposit_tail(&self, buf: &[u8]) -> usize {
        // A split end deposits into its linked opposite end; the shared-node
        // form has no link and refreshes the local mirror itself.
        let target = self
            .other_end
            .read()
            .unwrap()
            .upgrade()
            .unwrap_or_else(|| self.me.upgrade().expect("decoupling line dropped"));

        let tail = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
        let mut offset = INDEX_WIRE_SIZE;
        let first = get_complex(buf, offset);
        offset += COMPLEX_WIRE_SIZE;
        let second = get_complex(buf, offset);
        offset += COMPLEX_WIRE_SIZE;

        let mut guard = target.ring.write().unwrap();
        let ring = guard.as_mut().expect("exchange before initialization");
        if target.split {
            // The sender's own end is the receiver's far end.
            ring.volt2[tail] = first;
            ring.cur2[tail] = second;
        } else {
            ring.volt1[tail] = first;
            ring.cur1[tail] = second;
            ring.volt2[tail] = get_complex(buf, offset);
            offset += COMPLEX_WIRE_SIZE;
            ring.cur2[tail] = get_complex(buf, offset);
            offset += COMPLEX_WIRE_SIZE;
        }
        ring.head = (tail + 1) % ring.size;
        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::new_arena;
    use crate::components::node::SimNode;

    fn nodes(
        arena: &crate::attribute::ArenaRef,
    ) -> (
        Arc<SimNode<Complex64>>,
        Arc<SimNode<Complex64>>,
        Arc<SimNode<Complex64>>,
    ) {
        let gnd = SimNode::ground(arena);
        let n1 = SimNode::new(
            "n1",
            crate::components::node::PhaseType::Single,
            Complex64::new(1.0, 0.25),
            arena,
        );
        let n2 = SimNode::new(
            "n2",
            crate::components::node::PhaseType::Single,
            Complex64::new(0.8, -0.1),
            arena,
        );
        (gnd, n1, n2)
    }

    #[test]
    fn wire_round_trip_is_bit_exact() {
        let arena = new_arena();
        let (gnd, n1, n2) = nodes(&arena);
        let (end1, end2) = DecouplingLine::split_pair(
            "line", n1, 0, n2, 1, &gnd, 0.5, 0.03, 1e-5, &arena,
        );
        let omega = 2.0 * std::f64::consts::PI * 50.0;
        end1.initialize(omega, 1e-4).unwrap();
        end2.initialize(omega, 1e-4).unwrap();

        let mut buf = vec![0u8; end1.payload_size()];
        let written = end1.encode_tail(&mut buf);
        assert_eq!(written, 36);
        let consumed = end1.deposit_tail(&buf);
        assert_eq!(consumed, written);

        let (tail1, sent) = end1.tail_samples();
        let (tail2, received) = end2.tail_samples();
        assert_eq!(tail1, tail2);
        // The sender's own end lands in the receiver's far-end slots.
        for (s, r) in [(sent[0], received[2]), (sent[1], received[3])] {
            assert_eq!(s.re.to_bits(), r.re.to_bits());
            assert_eq!(s.im.to_bits(), r.im.to_bits());
        }
    }

    #[test]
    fn shared_node_form_carries_four_samples() {
        let arena = new_arena();
        let (gnd, n1, n2) = nodes(&arena);
        let line = DecouplingLine::new("line", n1, n2, &gnd, 0.0, 0.03, 1e-5, &arena);
        assert_eq!(line.payload_size(), 4 + 4 * 16);
    }

    #[test]
    fn too_large_time_step_is_a_capacity_error() {
        let arena = new_arena();
        let (gnd, n1, n2) = nodes(&arena);
        // delay = sqrt(L * C) ~ 0.55 ms, stepped at 1 ms
        let line = DecouplingLine::new("line", n1, n2, &gnd, 0.0, 0.03, 1e-5, &arena);
        match line.initialize(314.0, 1e-3) {
            Err(Error::Capacity(_)) => {}
            other => panic!("expected capacity error, got {other:?}"),
        }
    }
}
