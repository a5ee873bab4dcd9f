//! Flattened numerical snapshot of a grid.
//!
//! A [`NumericalCircuit`] is a plain value: struct-of-arrays blocks for buses,
//! branches and devices, index aligned so that the array position is the
//! identity of the element for one compilation. Topology processing and the
//! solvers only ever work on copies derived from it.

use nalgebra::DVector;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::error::{PowerFlowError, Result};
use super::sparse::cast::Cast;

/// Bus classification for the power balance equations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    /// Voltage magnitude and angle fixed.
    Slack,
    /// Active power and voltage magnitude fixed.
    PV,
    /// Active and reactive power fixed.
    #[default]
    PQ,
}

impl BusType {
    /// Strength used when several buses collapse into one calculation node.
    pub(crate) fn rank(self) -> u8 {
        match self {
            BusType::Slack => 2,
            BusType::PV => 1,
            BusType::PQ => 0,
        }
    }
}

/// One bus, used to append rows to [`BusData`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Bus {
    pub bus_type: BusType,
    pub active: bool,
    pub vnom_kv: f64,
    pub vmin: f64,
    pub vmax: f64,
    /// Voltage set point (p.u.) used when no generator provides one.
    pub v_set: f64,
    /// Angle set point (rad), relevant for slack buses and the flat start.
    pub va_set: f64,
    /// Directly specified injection (MW).
    pub p_set: f64,
    /// Directly specified injection (MVAr).
    pub q_set: f64,
    /// Fixed shunt at 1 p.u. in MVA, `G` consumed and `B` injected.
    pub y_shunt: Complex64,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            bus_type: BusType::PQ,
            active: true,
            vnom_kv: 1.0,
            vmin: 0.9,
            vmax: 1.1,
            v_set: 1.0,
            va_set: 0.0,
            p_set: 0.0,
            q_set: 0.0,
            y_shunt: Complex64::new(0.0, 0.0),
        }
    }
}

impl Bus {
    pub fn slack() -> Self {
        Self {
            bus_type: BusType::Slack,
            ..Default::default()
        }
    }

    pub fn pv() -> Self {
        Self {
            bus_type: BusType::PV,
            ..Default::default()
        }
    }

    pub fn pq() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusData {
    pub bus_type: Vec<BusType>,
    pub active: Vec<bool>,
    pub vnom_kv: Vec<f64>,
    pub vmin: Vec<f64>,
    pub vmax: Vec<f64>,
    pub v_set: Vec<f64>,
    pub va_set: Vec<f64>,
    pub p_set: Vec<f64>,
    pub q_set: Vec<f64>,
    pub y_shunt: Vec<Complex64>,
}

impl BusData {
    pub fn len(&self) -> usize {
        self.bus_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bus_type.is_empty()
    }

    pub fn push(&mut self, bus: Bus) {
        self.bus_type.push(bus.bus_type);
        self.active.push(bus.active);
        self.vnom_kv.push(bus.vnom_kv);
        self.vmin.push(bus.vmin);
        self.vmax.push(bus.vmax);
        self.v_set.push(bus.v_set);
        self.va_set.push(bus.va_set);
        self.p_set.push(bus.p_set);
        self.q_set.push(bus.q_set);
        self.y_shunt.push(bus.y_shunt);
    }

    pub fn get(&self, i: usize) -> Bus {
        Bus {
            bus_type: self.bus_type[i],
            active: self.active[i],
            vnom_kv: self.vnom_kv[i],
            vmin: self.vmin[i],
            vmax: self.vmax[i],
            v_set: self.v_set[i],
            va_set: self.va_set[i],
            p_set: self.p_set[i],
            q_set: self.q_set[i],
            y_shunt: self.y_shunt[i],
        }
    }

    fn check(&self) -> Result<()> {
        let n = self.len();
        check_len("bus.active", n, self.active.len())?;
        check_len("bus.vnom_kv", n, self.vnom_kv.len())?;
        check_len("bus.vmin", n, self.vmin.len())?;
        check_len("bus.vmax", n, self.vmax.len())?;
        check_len("bus.v_set", n, self.v_set.len())?;
        check_len("bus.va_set", n, self.va_set.len())?;
        check_len("bus.p_set", n, self.p_set.len())?;
        check_len("bus.q_set", n, self.q_set.len())?;
        check_len("bus.y_shunt", n, self.y_shunt.len())
    }
}

/// One branch (line, transformer, switch), used to append rows to
/// [`BranchData`]. Impedances are in p.u. on the system base.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Branch {
    pub f: usize,
    pub t: usize,
    pub r: f64,
    pub x: f64,
    pub g: f64,
    pub b: f64,
    pub tap_module: f64,
    /// Phase shift (rad).
    pub tap_angle: f64,
    pub vtap_f: f64,
    pub vtap_t: f64,
    /// Rating (MVA); zero means unrated.
    pub rate: f64,
    pub active: bool,
    /// Zero-impedance element merged away by the topology processor.
    pub reducible: bool,
    pub tap_control: bool,
    /// Bus whose voltage the tap changer regulates.
    pub tap_bus: usize,
    pub v_control: f64,
    pub tap_step: f64,
    pub tap_pos_min: i32,
    pub tap_pos_max: i32,
}

impl Default for Branch {
    fn default() -> Self {
        Self {
            f: 0,
            t: 0,
            r: 0.0,
            x: 0.0,
            g: 0.0,
            b: 0.0,
            tap_module: 1.0,
            tap_angle: 0.0,
            vtap_f: 1.0,
            vtap_t: 1.0,
            rate: 0.0,
            active: true,
            reducible: false,
            tap_control: false,
            tap_bus: 0,
            v_control: 1.0,
            tap_step: 0.0,
            tap_pos_min: 0,
            tap_pos_max: 0,
        }
    }
}

impl Branch {
    pub fn line(f: usize, t: usize, r: f64, x: f64, b: f64) -> Self {
        Self {
            f,
            t,
            r,
            x,
            b,
            ..Default::default()
        }
    }

    pub fn transformer(f: usize, t: usize, r: f64, x: f64, tap_module: f64, tap_angle: f64) -> Self {
        Self {
            f,
            t,
            r,
            x,
            tap_module,
            tap_angle,
            ..Default::default()
        }
    }

    /// A closed switch or jumper.
    pub fn switch(f: usize, t: usize) -> Self {
        Self {
            f,
            t,
            reducible: true,
            ..Default::default()
        }
    }

    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchData {
    pub f: Vec<usize>,
    pub t: Vec<usize>,
    pub r: Vec<f64>,
    pub x: Vec<f64>,
    pub g: Vec<f64>,
    pub b: Vec<f64>,
    pub tap_module: Vec<f64>,
    pub tap_angle: Vec<f64>,
    pub vtap_f: Vec<f64>,
    pub vtap_t: Vec<f64>,
    pub rate: Vec<f64>,
    pub active: Vec<bool>,
    pub reducible: Vec<bool>,
    pub tap_control: Vec<bool>,
    pub tap_bus: Vec<usize>,
    pub v_control: Vec<f64>,
    pub tap_step: Vec<f64>,
    pub tap_pos_min: Vec<i32>,
    pub tap_pos_max: Vec<i32>,
}

impl BranchData {
    pub fn len(&self) -> usize {
        self.f.len()
    }

    pub fn is_empty(&self) -> bool {
        self.f.is_empty()
    }

    pub fn push(&mut self, br: Branch) {
        self.f.push(br.f);
        self.t.push(br.t);
        self.r.push(br.r);
        self.x.push(br.x);
        self.g.push(br.g);
        self.b.push(br.b);
        self.tap_module.push(br.tap_module);
        self.tap_angle.push(br.tap_angle);
        self.vtap_f.push(br.vtap_f);
        self.vtap_t.push(br.vtap_t);
        self.rate.push(br.rate);
        self.active.push(br.active);
        self.reducible.push(br.reducible);
        self.tap_control.push(br.tap_control);
        self.tap_bus.push(br.tap_bus);
        self.v_control.push(br.v_control);
        self.tap_step.push(br.tap_step);
        self.tap_pos_min.push(br.tap_pos_min);
        self.tap_pos_max.push(br.tap_pos_max);
    }

    pub fn get(&self, k: usize) -> Branch {
        Branch {
            f: self.f[k],
            t: self.t[k],
            r: self.r[k],
            x: self.x[k],
            g: self.g[k],
            b: self.b[k],
            tap_module: self.tap_module[k],
            tap_angle: self.tap_angle[k],
            vtap_f: self.vtap_f[k],
            vtap_t: self.vtap_t[k],
            rate: self.rate[k],
            active: self.active[k],
            reducible: self.reducible[k],
            tap_control: self.tap_control[k],
            tap_bus: self.tap_bus[k],
            v_control: self.v_control[k],
            tap_step: self.tap_step[k],
            tap_pos_min: self.tap_pos_min[k],
            tap_pos_max: self.tap_pos_max[k],
        }
    }

    fn check(&self) -> Result<()> {
        let m = self.len();
        check_len("branch.t", m, self.t.len())?;
        check_len("branch.r", m, self.r.len())?;
        check_len("branch.x", m, self.x.len())?;
        check_len("branch.g", m, self.g.len())?;
        check_len("branch.b", m, self.b.len())?;
        check_len("branch.tap_module", m, self.tap_module.len())?;
        check_len("branch.tap_angle", m, self.tap_angle.len())?;
        check_len("branch.vtap_f", m, self.vtap_f.len())?;
        check_len("branch.vtap_t", m, self.vtap_t.len())?;
        check_len("branch.rate", m, self.rate.len())?;
        check_len("branch.active", m, self.active.len())?;
        check_len("branch.reducible", m, self.reducible.len())?;
        check_len("branch.tap_control", m, self.tap_control.len())?;
        check_len("branch.tap_bus", m, self.tap_bus.len())?;
        check_len("branch.v_control", m, self.v_control.len())?;
        check_len("branch.tap_step", m, self.tap_step.len())?;
        check_len("branch.tap_pos_min", m, self.tap_pos_min.len())?;
        check_len("branch.tap_pos_max", m, self.tap_pos_max.len())
    }
}

/// A ZIP load. Every component is the demand in MVA at 1 p.u. voltage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Load {
    pub bus: usize,
    pub active: bool,
    pub s: Complex64,
    pub i: Complex64,
    pub y: Complex64,
}

impl Default for Load {
    fn default() -> Self {
        Self {
            bus: 0,
            active: true,
            s: Complex64::new(0.0, 0.0),
            i: Complex64::new(0.0, 0.0),
            y: Complex64::new(0.0, 0.0),
        }
    }
}

impl Load {
    pub fn constant_power(bus: usize, p: f64, q: f64) -> Self {
        Self {
            bus,
            s: Complex64::new(p, q),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadData {
    pub bus: Vec<usize>,
    pub active: Vec<bool>,
    pub s: Vec<Complex64>,
    pub i: Vec<Complex64>,
    pub y: Vec<Complex64>,
}

impl LoadData {
    pub fn len(&self) -> usize {
        self.bus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bus.is_empty()
    }

    pub fn push(&mut self, load: Load) {
        self.bus.push(load.bus);
        self.active.push(load.active);
        self.s.push(load.s);
        self.i.push(load.i);
        self.y.push(load.y);
    }

    fn check(&self) -> Result<()> {
        let k = self.len();
        check_len("load.active", k, self.active.len())?;
        check_len("load.s", k, self.s.len())?;
        check_len("load.i", k, self.i.len())?;
        check_len("load.y", k, self.y.len())
    }
}

/// A generator or battery. Powers in MW/MVAr, voltage set point in p.u.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Generator {
    pub bus: usize,
    pub active: bool,
    pub p: f64,
    /// Reactive output, only used when the unit does not control voltage.
    pub q: f64,
    pub v_set: f64,
    pub q_min: f64,
    pub q_max: f64,
    /// Installed capacity (MVA), the share key for distributed slack.
    pub snom: f64,
    pub voltage_controlled: bool,
}

impl Default for Generator {
    fn default() -> Self {
        Self {
            bus: 0,
            active: true,
            p: 0.0,
            q: 0.0,
            v_set: 1.0,
            q_min: -9999.0,
            q_max: 9999.0,
            snom: 0.0,
            voltage_controlled: true,
        }
    }
}

impl Generator {
    pub fn new(bus: usize, p: f64, v_set: f64) -> Self {
        Self {
            bus,
            p,
            v_set,
            ..Default::default()
        }
    }

    pub fn with_q_limits(mut self, q_min: f64, q_max: f64) -> Self {
        self.q_min = q_min;
        self.q_max = q_max;
        self
    }

    pub fn with_snom(mut self, snom: f64) -> Self {
        self.snom = snom;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenData {
    pub bus: Vec<usize>,
    pub active: Vec<bool>,
    pub p: Vec<f64>,
    pub q: Vec<f64>,
    pub v_set: Vec<f64>,
    pub q_min: Vec<f64>,
    pub q_max: Vec<f64>,
    pub snom: Vec<f64>,
    pub voltage_controlled: Vec<bool>,
}

impl GenData {
    pub fn len(&self) -> usize {
        self.bus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bus.is_empty()
    }

    pub fn push(&mut self, g: Generator) {
        self.bus.push(g.bus);
        self.active.push(g.active);
        self.p.push(g.p);
        self.q.push(g.q);
        self.v_set.push(g.v_set);
        self.q_min.push(g.q_min);
        self.q_max.push(g.q_max);
        self.snom.push(g.snom);
        self.voltage_controlled.push(g.voltage_controlled);
    }

    fn check(&self, prefix: &'static [&'static str; 8]) -> Result<()> {
        let k = self.len();
        check_len(prefix[0], k, self.active.len())?;
        check_len(prefix[1], k, self.p.len())?;
        check_len(prefix[2], k, self.q.len())?;
        check_len(prefix[3], k, self.v_set.len())?;
        check_len(prefix[4], k, self.q_min.len())?;
        check_len(prefix[5], k, self.q_max.len())?;
        check_len(prefix[6], k, self.snom.len())?;
        check_len(prefix[7], k, self.voltage_controlled.len())
    }

    /// Units that regulate the voltage of their bus.
    fn controls(&self, k: usize) -> bool {
        self.active[k] && self.voltage_controlled[k]
    }
}

const GEN_FIELDS: [&str; 8] = [
    "generator.active",
    "generator.p",
    "generator.q",
    "generator.v_set",
    "generator.q_min",
    "generator.q_max",
    "generator.snom",
    "generator.voltage_controlled",
];
const BATTERY_FIELDS: [&str; 8] = [
    "battery.active",
    "battery.p",
    "battery.q",
    "battery.v_set",
    "battery.q_min",
    "battery.q_max",
    "battery.snom",
    "battery.voltage_controlled",
];

/// A fixed shunt. `y` is the admittance in MVA at 1 p.u., `G` consumed and
/// `B` injected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Shunt {
    pub bus: usize,
    pub active: bool,
    pub y: Complex64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShuntData {
    pub bus: Vec<usize>,
    pub active: Vec<bool>,
    pub y: Vec<Complex64>,
}

impl ShuntData {
    pub fn len(&self) -> usize {
        self.bus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bus.is_empty()
    }

    pub fn push(&mut self, sh: Shunt) {
        self.bus.push(sh.bus);
        self.active.push(sh.active);
        self.y.push(sh.y);
    }

    fn check(&self) -> Result<()> {
        let k = self.len();
        check_len("shunt.active", k, self.active.len())?;
        check_len("shunt.y", k, self.y.len())
    }
}

/// Compiled grid snapshot consumed by the power flow core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumericalCircuit {
    /// System base (MVA).
    pub sbase: f64,
    pub bus: BusData,
    pub branch: BranchData,
    pub load: LoadData,
    pub generator: GenData,
    pub battery: GenData,
    pub shunt: ShuntData,
}

impl Default for NumericalCircuit {
    fn default() -> Self {
        Self::new(100.0)
    }
}

/// Per-bus quantities in p.u. derived from the device arrays.
#[derive(Debug, Clone)]
pub struct BusInjections {
    /// Bus types after demoting PV buses without an active regulating unit.
    pub bus_types: Vec<BusType>,
    /// Constant power injection.
    pub s0: DVector<Complex64>,
    /// Constant current injection, scaled by `|V|` in the power balance.
    pub i0: DVector<Complex64>,
    /// Shunt admittance from bus shunts, shunt devices and the Z part of loads.
    pub y0: DVector<Complex64>,
    /// Initial voltage: set points for PV/slack buses, flat elsewhere.
    pub v0: DVector<Complex64>,
    pub q_min: DVector<f64>,
    pub q_max: DVector<f64>,
    /// Installed generation (MVA), the distributed slack share key.
    pub installed_power: DVector<f64>,
}

impl BusInjections {
    /// Specified complex power at the given voltage magnitudes.
    pub fn sbus(&self, vm: &DVector<f64>) -> DVector<Complex64> {
        let mut s = self.s0.clone();
        s.iter_mut()
            .zip(self.i0.iter().zip(vm.iter()))
            .for_each(|(s, (i, vm))| *s += i * vm);
        s
    }

    pub fn indices_of(&self, kind: BusType, active: &[bool]) -> Vec<usize> {
        self.bus_types
            .iter()
            .enumerate()
            .filter(|(i, t)| active[*i] && **t == kind)
            .map(|(i, _)| i)
            .collect()
    }
}

impl NumericalCircuit {
    pub fn new(sbase: f64) -> Self {
        Self {
            sbase,
            bus: BusData::default(),
            branch: BranchData::default(),
            load: LoadData::default(),
            generator: GenData::default(),
            battery: GenData::default(),
            shunt: ShuntData::default(),
        }
    }

    pub fn nbus(&self) -> usize {
        self.bus.len()
    }

    pub fn nbranch(&self) -> usize {
        self.branch.len()
    }

    pub fn add_bus(&mut self, bus: Bus) -> usize {
        self.bus.push(bus);
        self.nbus() - 1
    }

    pub fn add_branch(&mut self, branch: Branch) -> usize {
        self.branch.push(branch);
        self.nbranch() - 1
    }

    pub fn add_load(&mut self, load: Load) {
        self.load.push(load);
    }

    pub fn add_generator(&mut self, generator: Generator) {
        self.generator.push(generator);
    }

    pub fn add_battery(&mut self, battery: Generator) {
        self.battery.push(battery);
    }

    pub fn add_shunt(&mut self, shunt: Shunt) {
        self.shunt.push(shunt);
    }

    pub fn active_bus_count(&self) -> usize {
        self.bus.active.iter().filter(|a| **a).count()
    }

    /// Whether branch `k` takes part in the admittance matrices: active,
    /// between two active buses, not reducible and not a self-loop.
    pub fn branch_in_calculation(&self, k: usize) -> bool {
        let (f, t) = (self.branch.f[k], self.branch.t[k]);
        self.branch.active[k]
            && !self.branch.reducible[k]
            && f != t
            && self.bus.active[f]
            && self.bus.active[t]
    }

    /// Checks array lengths, bus references and impedance signs.
    ///
    /// With `reject_self_loops` a branch from a bus to itself is an error;
    /// otherwise it is only excluded from the calculation.
    pub fn validate(&self, reject_self_loops: bool) -> Result<()> {
        if !(self.sbase > 0.0) {
            return Err(PowerFlowError::InvalidOption(format!(
                "sbase must be positive, got {}",
                self.sbase
            )));
        }
        self.bus.check()?;
        self.branch.check()?;
        self.load.check()?;
        self.generator.check(&GEN_FIELDS)?;
        self.battery.check(&BATTERY_FIELDS)?;
        self.shunt.check()?;

        let n = self.nbus();
        check_refs("branch.f", &self.branch.f, n)?;
        check_refs("branch.t", &self.branch.t, n)?;
        for k in 0..self.nbranch() {
            if self.branch.tap_control[k] && self.branch.tap_bus[k] >= n {
                return Err(PowerFlowError::out_of_range(
                    "branch.tap_bus",
                    k,
                    self.branch.tap_bus[k],
                    n,
                ));
            }
            if self.branch.r[k] < 0.0 || !(self.branch.tap_module[k] > 0.0) {
                return Err(PowerFlowError::NegativeImpedance { branch: k });
            }
            if self.branch.f[k] == self.branch.t[k] {
                if reject_self_loops {
                    return Err(PowerFlowError::SelfLoop { branch: k });
                }
                log::warn!("branch {k} is a self-loop on bus {}, excluded", self.branch.f[k]);
            }
        }
        check_refs("load.bus", &self.load.bus, n)?;
        check_refs("generator.bus", &self.generator.bus, n)?;
        check_refs("battery.bus", &self.battery.bus, n)?;
        check_refs("shunt.bus", &self.shunt.bus, n)?;
        Ok(())
    }

    /// Computes the per-bus injections, shunts, limits and initial voltage.
    pub fn bus_injections(&self) -> BusInjections {
        let n = self.nbus();
        let sbase = self.sbase;

        let c_load = device_incidence(&self.load.bus, &self.load.active, n);
        let c_gen = device_incidence(&self.generator.bus, &self.generator.active, n);
        let c_bat = device_incidence(&self.battery.bus, &self.battery.active, n);
        let c_sh = device_incidence(&self.shunt.bus, &self.shunt.active, n);

        let gen_s = unit_injections(&self.generator, sbase);
        let bat_s = unit_injections(&self.battery, sbase);
        let load_s = DVector::from_iterator(self.load.len(), self.load.s.iter().map(|s| -s / sbase));
        let load_i = DVector::from_iterator(self.load.len(), self.load.i.iter().map(|i| -i / sbase));
        let load_y =
            DVector::from_iterator(self.load.len(), self.load.y.iter().map(|y| y.conj() / sbase));
        let shunt_y = DVector::from_iterator(self.shunt.len(), self.shunt.y.iter().map(|y| y / sbase));

        let bus_s = DVector::from_iterator(
            n,
            (0..n).map(|i| Complex64::new(self.bus.p_set[i], self.bus.q_set[i]) / sbase),
        );
        let bus_y = DVector::from_iterator(n, self.bus.y_shunt.iter().map(|y| y / sbase));

        let s0 = bus_s + to_buses(&c_gen, &gen_s) + to_buses(&c_bat, &bat_s) + to_buses(&c_load, &load_s);
        let i0 = to_buses(&c_load, &load_i);
        let y0 = bus_y + to_buses(&c_load, &load_y) + to_buses(&c_sh, &shunt_y);

        let mut v_set: Vec<Option<f64>> = vec![None; n];
        let mut q_min = DVector::zeros(n);
        let mut q_max = DVector::zeros(n);
        let mut installed_power = DVector::zeros(n);
        for units in [&self.generator, &self.battery] {
            for k in 0..units.len() {
                if !units.active[k] {
                    continue;
                }
                let b = units.bus[k];
                installed_power[b] += units.snom[k];
                if units.controls(k) {
                    v_set[b].get_or_insert(units.v_set[k]);
                    q_min[b] += units.q_min[k] / sbase;
                    q_max[b] += units.q_max[k] / sbase;
                }
            }
        }

        let bus_types: Vec<BusType> = (0..n)
            .map(|i| match self.bus.bus_type[i] {
                BusType::PV if v_set[i].is_none() => {
                    log::debug!("bus {i} is PV without a regulating unit, treated as PQ");
                    BusType::PQ
                }
                t => t,
            })
            .collect();

        let v0 = DVector::from_iterator(
            n,
            (0..n).map(|i| {
                let vm = match bus_types[i] {
                    BusType::PQ => 1.0,
                    _ => v_set[i].unwrap_or(self.bus.v_set[i]),
                };
                Complex64::from_polar(vm, self.bus.va_set[i])
            }),
        );

        BusInjections {
            bus_types,
            s0,
            i0,
            y0,
            v0,
            q_min,
            q_max,
            installed_power,
        }
    }
}

fn check_len(field: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected != found {
        return Err(PowerFlowError::length_mismatch(field, expected, found));
    }
    Ok(())
}

fn check_refs(field: &'static str, refs: &[usize], n: usize) -> Result<()> {
    match refs.iter().position(|&b| b >= n) {
        Some(k) => Err(PowerFlowError::out_of_range(field, k, refs[k], n)),
        None => Ok(()),
    }
}

fn unit_injections(units: &GenData, sbase: f64) -> DVector<Complex64> {
    DVector::from_iterator(
        units.len(),
        (0..units.len()).map(|k| {
            let q = if units.voltage_controlled[k] { 0.0 } else { units.q[k] };
            Complex64::new(units.p[k], q) / sbase
        }),
    )
}

/// Device-to-bus incidence (devices × buses); inactive devices get an empty
/// row.
pub fn device_incidence(bus: &[usize], active: &[bool], nbus: usize) -> CscMatrix<f64> {
    let mut coo = CooMatrix::new(bus.len(), nbus);
    bus.iter()
        .zip(active)
        .enumerate()
        .filter(|(_, (_, a))| **a)
        .for_each(|(k, (b, _))| coo.push(k, *b, 1.0));
    CscMatrix::from(&coo)
}

/// Sums device values onto their buses, `C^T · values`.
fn to_buses(incidence: &CscMatrix<f64>, values: &DVector<Complex64>) -> DVector<Complex64> {
    &incidence.transpose().cast() * values
}
