use anyhow::Result;
use chrono::Utc;
use hybrid_energy_controller::{config, controller, simulation, telemetry};
use config::Config;
use controller::EnergyController;
use simulation::SimulatedPlant;
use telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;

    if cfg.simulation.seed.is_none() {
        warn!("no simulation seed configured - runs will not be reproducible");
    }

    info!(
        interval_s = cfg.controller.interval_s,
        chemistry = %cfg.battery.chemistry,
        banks = cfg.battery.banks.len(),
        loads = cfg.loads.len(),
        "starting hybrid energy controller"
    );

    let plant = SimulatedPlant::new(&cfg);
    let mut controller = EnergyController::new(cfg, plant, Utc::now())?;
    controller.run(telemetry::shutdown_signal()).await;

    let stats = controller.statistics();
    info!(
        cycles = stats.cycles,
        pv_energy_kwh = stats.pv_energy_kwh,
        grid_import_kwh = stats.grid_import_kwh,
        grid_export_kwh = stats.grid_export_kwh,
        self_sufficiency = stats.self_sufficiency(),
        "shutdown complete"
    );
    Ok(())
}
