//! CLI driver: run one day of GTFS-RT fixes against one static GTFS
//! snapshot and write the aggregate tables.
//!
//! Exit codes: 0 success, 1 invalid input, 2 partial failure (some
//! routes errored), 3 fatal.

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::process::ExitCode;

use transit_otp::{run_day, write_outputs, PipelineConfig};

#[derive(Parser)]
#[command(name = "transit-otp")]
#[command(about = "Reconstruct vehicle trajectories and compute stop-level on-time performance", long_about = None)]
struct Cli {
    /// Folder hosting the conventional data layout (0_external ... 7_requests)
    main_folder: PathBuf,

    /// Date of the static GTFS snapshot (e.g. 2021-11-17)
    #[arg(long)]
    gtfs_date: String,

    /// Date of the collected GTFS-RT data (e.g. 2021-11-20)
    #[arg(long)]
    raw_date: chrono::NaiveDate,

    /// Spatial reference of the catalog geometry
    #[arg(long, default_value_t = 4326)]
    wkid: i32,

    /// Worker threads for the per-route fan-out (default: all cores)
    #[arg(long)]
    workers: Option<usize>,

    /// Fail routes whose task has not started after this many seconds
    /// (default: unlimited)
    #[arg(long)]
    timeout_s: Option<u64>,

    /// Offset of the schedule's local clock from UTC, in hours
    #[arg(long, default_value_t = 0)]
    utc_offset_hours: i32,

    /// Also export the per-route intermediate tables
    #[arg(long, default_value_t = false)]
    write_intermediates: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = PipelineConfig {
        wkid: cli.wkid,
        workers: cli.workers,
        global_timeout_s: cli.timeout_s,
        schedule_utc_offset_s: cli.utc_offset_hours * 3600,
        write_intermediates: cli.write_intermediates,
        ..PipelineConfig::default()
    };

    let output = match run_day(&cli.main_folder, &cli.gtfs_date, cli.raw_date, &config) {
        Ok(output) => output,
        Err(e) => {
            error!("{}", e);
            return ExitCode::from(e.exit_code() as u8);
        }
    };

    for report in &output.manifest.routes {
        info!(
            "{}-{}: retention {:.1}%, {} aggregated stops, {} errors{}",
            report.route_id,
            report.direction,
            report.retention * 100.0,
            report.refined_rows,
            report.errors.len(),
            if report.failed { " [FAILED]" } else { "" }
        );
    }
    info!(
        "{} routes ({} failed), {} fixes ({} unmatched), {} trip-stop rows, {} hourly, {} daily",
        output.manifest.routes.len(),
        output.manifest.failed_routes,
        output.manifest.total_fixes,
        output.manifest.unmatched_fixes,
        output.trip_stop.len(),
        output.hourly.len(),
        output.daily.len()
    );

    if let Err(e) = write_outputs(
        &output,
        &cli.main_folder,
        &cli.gtfs_date,
        &cli.raw_date.format("%Y-%m-%d").to_string(),
    ) {
        error!("{}", e);
        return ExitCode::from(e.exit_code() as u8);
    }

    ExitCode::from(output.exit_code() as u8)
}
