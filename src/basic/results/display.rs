use std::fmt;

use tabled::{Table, Tabled, settings::Style};

use super::{IslandStatus, PowerFlowResults};

/// A float printed with a fixed number of decimals.
#[derive(Clone, Copy, PartialEq, PartialOrd)]
pub(crate) struct FloatWrapper {
    pub(crate) value: f64,
    pub(crate) precision: usize,
}

impl FloatWrapper {
    pub fn new(value: f64, precision: usize) -> Self {
        FloatWrapper { value, precision }
    }
}

impl fmt::Display for FloatWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1$}", self.value, self.precision)
    }
}

impl fmt::Debug for FloatWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1$}", self.value, self.precision)
    }
}

#[derive(Debug, Tabled)]
struct IslandRow {
    island: usize,
    buses: usize,
    status: String,
    method: String,
    iterations: usize,
    error: String,
}

#[derive(Debug, Tabled)]
struct BusRow {
    bus: usize,
    vm_pu: FloatWrapper,
    va_degree: FloatWrapper,
    p_mw: FloatWrapper,
    q_mvar: FloatWrapper,
}

#[derive(Debug, Tabled)]
struct BranchRow {
    branch: usize,
    from: usize,
    to: usize,
    p_from_mw: FloatWrapper,
    q_from_mvar: FloatWrapper,
    p_to_mw: FloatWrapper,
    q_to_mvar: FloatWrapper,
    pl_mw: FloatWrapper,
    ql_mvar: FloatWrapper,
    loading_percent: FloatWrapper,
}

impl PowerFlowResults {
    pub fn island_table(&self) -> String {
        let rows = self.islands.iter().enumerate().map(|(i, r)| IslandRow {
            island: i,
            buses: r.buses.len(),
            status: match &r.status {
                IslandStatus::Failed(e) => format!("failed: {e}"),
                s => format!("{s:?}"),
            },
            method: r.method.map(|m| format!("{m:?}")).unwrap_or_default(),
            iterations: r.iterations,
            error: format!("{:.3e}", r.error),
        });
        Table::new(rows).with(Style::markdown()).to_string()
    }

    pub fn bus_table(&self) -> String {
        let rows = (0..self.voltage.len()).map(|i| BusRow {
            bus: i,
            vm_pu: FloatWrapper::new(self.voltage[i].norm(), 4),
            va_degree: FloatWrapper::new(self.voltage[i].arg().to_degrees(), 3),
            p_mw: FloatWrapper::new(self.sbus[i].re, 3),
            q_mvar: FloatWrapper::new(self.sbus[i].im, 3),
        });
        Table::new(rows).with(Style::markdown()).to_string()
    }

    pub fn branch_table(&self) -> String {
        let rows = self.branch_ends.iter().enumerate().map(|(k, &(from, to))| BranchRow {
            branch: k,
            from,
            to,
            p_from_mw: FloatWrapper::new(self.sf[k].re, 3),
            q_from_mvar: FloatWrapper::new(self.sf[k].im, 3),
            p_to_mw: FloatWrapper::new(self.st[k].re, 3),
            q_to_mvar: FloatWrapper::new(self.st[k].im, 3),
            pl_mw: FloatWrapper::new(self.losses[k].re, 3),
            ql_mvar: FloatWrapper::new(self.losses[k].im, 3),
            loading_percent: FloatWrapper::new(self.loading[k] * 100.0, 1),
        });
        Table::new(rows).with(Style::markdown()).to_string()
    }
}

impl fmt::Display for PowerFlowResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "converged: {}, error: {:.3e}, iterations: {}, elapsed: {:?}\n",
            self.converged, self.error, self.iterations, self.elapsed
        )?;
        writeln!(f, "{}\n", self.island_table())?;
        writeln!(f, "{}\n", self.bus_table())?;
        write!(f, "{}", self.branch_table())
    }
}
