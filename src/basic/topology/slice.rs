use derive_more::derive::{Deref, From, Into};

use super::islands::Island;
use crate::basic::circuit::{BranchData, BusData, GenData, LoadData, NumericalCircuit, ShuntData};

/// Original bus index to island-local index, `-1` for buses outside.
#[derive(Debug, Clone, PartialEq, Eq, Deref, From, Into)]
pub struct BusMap(Vec<i64>);

impl BusMap {
    pub fn new(island: &Island, nbus: usize) -> Self {
        let mut map = vec![-1; nbus];
        for (local, &bus) in island.iter().enumerate() {
            map[bus] = local as i64;
        }
        Self(map)
    }

    pub fn local(&self, bus: usize) -> Option<usize> {
        match self.0.get(bus) {
            Some(&i) if i >= 0 => Some(i as usize),
            _ => None,
        }
    }
}

/// A self-contained circuit for one island and the maps back to the
/// circuit it was cut from.
#[derive(Debug, Clone)]
pub struct IslandCircuit {
    pub circuit: NumericalCircuit,
    pub bus_map: BusMap,
    /// Global index of every local bus, equal to the island itself.
    pub bus_origin: Vec<usize>,
    /// Global index of every local branch.
    pub branch_origin: Vec<usize>,
}

pub(crate) fn pick<T: Clone>(values: &[T], idx: &[usize]) -> Vec<T> {
    idx.iter().map(|&i| values[i].clone()).collect()
}

impl BusData {
    fn subset(&self, idx: &[usize]) -> Self {
        Self {
            bus_type: pick(&self.bus_type, idx),
            active: pick(&self.active, idx),
            vnom_kv: pick(&self.vnom_kv, idx),
            vmin: pick(&self.vmin, idx),
            vmax: pick(&self.vmax, idx),
            v_set: pick(&self.v_set, idx),
            va_set: pick(&self.va_set, idx),
            p_set: pick(&self.p_set, idx),
            q_set: pick(&self.q_set, idx),
            y_shunt: pick(&self.y_shunt, idx),
        }
    }
}

impl BranchData {
    pub(crate) fn subset(&self, idx: &[usize]) -> Self {
        Self {
            f: pick(&self.f, idx),
            t: pick(&self.t, idx),
            r: pick(&self.r, idx),
            x: pick(&self.x, idx),
            g: pick(&self.g, idx),
            b: pick(&self.b, idx),
            tap_module: pick(&self.tap_module, idx),
            tap_angle: pick(&self.tap_angle, idx),
            vtap_f: pick(&self.vtap_f, idx),
            vtap_t: pick(&self.vtap_t, idx),
            rate: pick(&self.rate, idx),
            active: pick(&self.active, idx),
            reducible: pick(&self.reducible, idx),
            tap_control: pick(&self.tap_control, idx),
            tap_bus: pick(&self.tap_bus, idx),
            v_control: pick(&self.v_control, idx),
            tap_step: pick(&self.tap_step, idx),
            tap_pos_min: pick(&self.tap_pos_min, idx),
            tap_pos_max: pick(&self.tap_pos_max, idx),
        }
    }
}

impl LoadData {
    fn subset(&self, idx: &[usize]) -> Self {
        Self {
            bus: pick(&self.bus, idx),
            active: pick(&self.active, idx),
            s: pick(&self.s, idx),
            i: pick(&self.i, idx),
            y: pick(&self.y, idx),
        }
    }
}

impl GenData {
    fn subset(&self, idx: &[usize]) -> Self {
        Self {
            bus: pick(&self.bus, idx),
            active: pick(&self.active, idx),
            p: pick(&self.p, idx),
            q: pick(&self.q, idx),
            v_set: pick(&self.v_set, idx),
            q_min: pick(&self.q_min, idx),
            q_max: pick(&self.q_max, idx),
            snom: pick(&self.snom, idx),
            voltage_controlled: pick(&self.voltage_controlled, idx),
        }
    }
}

impl ShuntData {
    fn subset(&self, idx: &[usize]) -> Self {
        Self {
            bus: pick(&self.bus, idx),
            active: pick(&self.active, idx),
            y: pick(&self.y, idx),
        }
    }
}

/// Devices connected to a bus of the island.
fn devices_in(bus: &[usize], map: &BusMap) -> Vec<usize> {
    (0..bus.len()).filter(|&k| map.local(bus[k]).is_some()).collect()
}

fn relabel(buses: &mut [usize], map: &BusMap) {
    buses
        .iter_mut()
        .for_each(|b| *b = map.local(*b).unwrap_or_default());
}

impl NumericalCircuit {
    /// Cuts the island out of the circuit with buses renumbered `0..k`.
    ///
    /// Branches are kept when both ends lie in the island, devices when
    /// their bus does. A tap changer regulating a bus outside the island
    /// loses its control.
    pub fn slice(&self, island: &Island) -> IslandCircuit {
        let bus_map = BusMap::new(island, self.nbus());
        let branch_origin: Vec<usize> = (0..self.nbranch())
            .filter(|&k| {
                bus_map.local(self.branch.f[k]).is_some() && bus_map.local(self.branch.t[k]).is_some()
            })
            .collect();

        let mut branch = self.branch.subset(&branch_origin);
        for k in 0..branch.len() {
            if branch.tap_control[k] && bus_map.local(branch.tap_bus[k]).is_none() {
                log::warn!(
                    "tap of branch {} regulates a bus outside its island, control disabled",
                    branch_origin[k]
                );
                branch.tap_control[k] = false;
            }
        }
        relabel(&mut branch.f, &bus_map);
        relabel(&mut branch.t, &bus_map);
        relabel(&mut branch.tap_bus, &bus_map);

        let mut load = self.load.subset(&devices_in(&self.load.bus, &bus_map));
        let mut generator = self.generator.subset(&devices_in(&self.generator.bus, &bus_map));
        let mut battery = self.battery.subset(&devices_in(&self.battery.bus, &bus_map));
        let mut shunt = self.shunt.subset(&devices_in(&self.shunt.bus, &bus_map));
        relabel(&mut load.bus, &bus_map);
        relabel(&mut generator.bus, &bus_map);
        relabel(&mut battery.bus, &bus_map);
        relabel(&mut shunt.bus, &bus_map);

        IslandCircuit {
            circuit: NumericalCircuit {
                sbase: self.sbase,
                bus: self.bus.subset(island),
                branch,
                load,
                generator,
                battery,
                shunt,
            },
            bus_map,
            bus_origin: island.to_vec(),
            branch_origin,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::circuit::{Branch, Bus, Generator, Load};
    use crate::basic::system::Connectivity;
    use crate::basic::topology::find_islands;

    fn two_islands() -> NumericalCircuit {
        let mut c = NumericalCircuit::new(100.0);
        c.add_bus(Bus::slack());
        c.add_bus(Bus::slack());
        c.add_bus(Bus::pq());
        c.add_bus(Bus::pq());
        c.add_branch(Branch::line(0, 2, 0.01, 0.1, 0.0));
        c.add_branch(Branch::line(1, 3, 0.02, 0.2, 0.0));
        c.add_load(Load::constant_power(3, 5.0, 1.0));
        c.add_load(Load::constant_power(2, 4.0, 1.0));
        c.add_generator(Generator::new(1, 0.0, 1.01));
        c
    }

    #[test]
    fn test_bus_map_round_trip() {
        let island = Island::from(vec![1, 3, 6]);
        let map = BusMap::new(&island, 8);
        for (l, &g) in island.iter().enumerate() {
            assert_eq!(map.local(g), Some(l));
            assert_eq!(island[map[g] as usize], g);
        }
        assert_eq!(map.iter().filter(|&&i| i == -1).count(), 5);
        assert_eq!(map.local(0), None);
        assert_eq!(map.local(42), None);
    }

    #[test]
    fn test_slice_relabels_everything() {
        let c = two_islands();
        let conn = Connectivity::new(&c);
        let islands = find_islands(&conn.adjacency(), &c.bus.active);
        assert_eq!(islands.len(), 2);

        let sl = c.slice(&islands[1]);
        assert_eq!(sl.bus_origin, vec![1, 3]);
        assert_eq!(sl.branch_origin, vec![1]);
        assert_eq!(sl.circuit.nbus(), 2);
        assert_eq!((sl.circuit.branch.f[0], sl.circuit.branch.t[0]), (0, 1));
        assert_eq!(sl.circuit.load.bus, vec![1]);
        assert_eq!(sl.circuit.load.s[0].re, 5.0);
        assert_eq!(sl.circuit.generator.bus, vec![0]);
        assert!(sl.circuit.validate(true).is_ok());

        let sl0 = c.slice(&islands[0]);
        assert!(sl0.circuit.generator.is_empty());
        assert_eq!(sl0.circuit.load.bus, vec![1]);
    }
}
