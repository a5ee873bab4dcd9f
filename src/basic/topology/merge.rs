use num_complex::Complex64;

use super::islands::find_islands;
use crate::basic::circuit::NumericalCircuit;
use crate::basic::system::Connectivity;

/// A calculation copy of a circuit with its reducible branches collapsed.
#[derive(Debug, Clone)]
pub struct Reduction {
    /// Same bus indexing as the input; merged-away buses are inactive.
    pub circuit: NumericalCircuit,
    /// `representative[i]` is the bus that `i` was merged into (`i` itself
    /// when untouched).
    pub representative: Vec<usize>,
    /// Original index of every branch of the reduced circuit.
    pub branch_origin: Vec<usize>,
}

/// Collapses every group of buses joined by active reducible branches into
/// its lowest-indexed bus.
///
/// The representative takes the strongest bus type of its group
/// (`Slack > PV > PQ`) and the sum of the bus level injections and shunts.
/// Reducible branches are dropped and all other references are rewritten.
/// The input is left untouched; reducing twice yields the same circuit.
pub fn reduce_branches(circuit: &NumericalCircuit, conn: &Connectivity) -> Reduction {
    let n = circuit.nbus();
    let mut representative: Vec<usize> = (0..n).collect();
    let mut out = circuit.clone();

    if conn.cr.nnz() > 0 {
        for group in find_islands(&conn.reducible_adjacency(), &circuit.bus.active) {
            let Some((&rep, rest)) = group.split_first() else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            log::debug!("merging buses {rest:?} into bus {rep}");
            let strongest = *group
                .iter()
                .max_by_key(|&&b| (circuit.bus.bus_type[b].rank(), std::cmp::Reverse(b)))
                .unwrap_or(&rep);
            let bus = &mut out.bus;
            bus.bus_type[rep] = circuit.bus.bus_type[strongest];
            bus.v_set[rep] = circuit.bus.v_set[strongest];
            bus.va_set[rep] = circuit.bus.va_set[strongest];
            for &b in rest {
                representative[b] = rep;
                bus.p_set[rep] += circuit.bus.p_set[b];
                bus.q_set[rep] += circuit.bus.q_set[b];
                bus.y_shunt[rep] += circuit.bus.y_shunt[b];
                bus.p_set[b] = 0.0;
                bus.q_set[b] = 0.0;
                bus.y_shunt[b] = Complex64::new(0.0, 0.0);
                bus.active[b] = false;
            }
        }
    }

    let branch_origin: Vec<usize> = (0..circuit.nbranch())
        .filter(|&k| !circuit.branch.reducible[k])
        .collect();
    out.branch = circuit.branch.subset(&branch_origin);
    let remap = |buses: &mut Vec<usize>| buses.iter_mut().for_each(|b| *b = representative[*b]);
    remap(&mut out.branch.f);
    remap(&mut out.branch.t);
    remap(&mut out.branch.tap_bus);
    remap(&mut out.load.bus);
    remap(&mut out.generator.bus);
    remap(&mut out.battery.bus);
    remap(&mut out.shunt.bus);

    let inner = branch_origin
        .iter()
        .enumerate()
        .filter(|&(j, &k)| circuit.branch.f[k] != circuit.branch.t[k] && out.branch.f[j] == out.branch.t[j])
        .count();
    if inner > 0 {
        log::debug!("{inner} branches lie inside merged bus groups and are excluded");
    }

    Reduction {
        circuit: out,
        representative,
        branch_origin,
    }
}
