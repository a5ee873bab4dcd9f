use gridflow::{prelude::*, testcases};

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let circuit = testcases::from_json(testcases::THREE_BUS_JSON)
        .map_err(|e| PowerFlowError::InvalidOption(e.to_string()))?;
    let results = run_power_flow(&circuit, &PowerFlowOptions::default())?;
    println!("{results}");

    // the same grid through the fast-decoupled solver, warm started
    let options = PowerFlowOptions::default().with_solver(SolverType::FastDecoupledXB);
    let again = PowerFlow::new(&circuit, options).with_warm_start(&results).run()?;
    println!(
        "fast-decoupled from the previous solution: {} iterations, error {:.3e}",
        again.iterations, again.error
    );
    Ok(())
}
