//! Output sinks: the three aggregate tables, the run manifest, and the
//! optional per-route intermediate exports, all laid out in the
//! conventional folder structure.
//!
//! Everything here runs in the reducer, after the fan-out has joined;
//! no file is ever written by two workers.

use itertools::Itertools;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::Direction;
use crate::error::{OtpError, Result};
use crate::executor::RunOutput;
use crate::{DailyAggregate, TripStopAggregate};

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| OtpError::io(path.display().to_string(), e))
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| OtpError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    for row in rows {
        writer.serialize(row).map_err(|e| OtpError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
    }
    writer.flush().map_err(|e| OtpError::io(path.display().to_string(), e))
}

/// Flat CSV shape of a level-1 row; the observation lists are joined
/// into single cells.
#[derive(Serialize)]
struct TripStopRecord<'a> {
    route_id: &'a str,
    direction: Direction,
    trip_id: &'a str,
    stop_sequence: u32,
    stop_id: &'a str,
    sched_arr: String,
    off_earr: Option<String>,
    lprfrte: String,
    ref_hr: u32,
    avg_spd: f64,
    avg_arrdif: f64,
    idx: u32,
    total_obs: u32,
    late: u32,
    on_time: u32,
    early: u32,
    satis: u32,
    unsatis: u32,
    prc_obs_sat: f64,
    prc_obs_uns: f64,
    spd_list: String,
    arrdif_list: String,
    x: Option<f64>,
    y: Option<f64>,
}

impl<'a> From<&'a TripStopAggregate> for TripStopRecord<'a> {
    fn from(a: &'a TripStopAggregate) -> Self {
        Self {
            route_id: &a.route_id,
            direction: a.direction,
            trip_id: &a.trip_id,
            stop_sequence: a.stop_sequence,
            stop_id: &a.stop_id,
            sched_arr: a.sched_arr.to_rfc3339(),
            off_earr: a.off_earr.map(|t| t.to_rfc3339()),
            lprfrte: a.lprfrte.to_string(),
            ref_hr: a.ref_hr,
            avg_spd: a.avg_spd,
            avg_arrdif: a.avg_arrdif,
            idx: a.idx,
            total_obs: a.total_obs,
            late: a.late,
            on_time: a.on_time,
            early: a.early,
            satis: a.satis,
            unsatis: a.unsatis,
            prc_obs_sat: a.prc_obs_sat,
            prc_obs_uns: a.prc_obs_uns,
            spd_list: a.spd_list.iter().map(|v| format!("{:.2}", v)).join(";"),
            arrdif_list: a.arrdif_list.iter().join(";"),
            x: a.x,
            y: a.y,
        }
    }
}

#[derive(Serialize)]
struct DailyRecord<'a> {
    route_id: &'a str,
    direction: Direction,
    stop_id: &'a str,
    stop_sequence: u32,
    agglength: u32,
    list_refhr: String,
    cnt_trip_ids: u32,
    all_obs: u32,
    avg_spd: f64,
    spd_w: f64,
    avg_arrdif: f64,
    arrd_w: f64,
    prc_obs_sat: f64,
    prc_obs_uns: f64,
    prcw_sat: f64,
    prcw_uns: f64,
    act_sat_p: f64,
    act_uns_p: f64,
    x: Option<f64>,
    y: Option<f64>,
}

impl<'a> From<&'a DailyAggregate> for DailyRecord<'a> {
    fn from(a: &'a DailyAggregate) -> Self {
        Self {
            route_id: &a.route_id,
            direction: a.direction,
            stop_id: &a.stop_id,
            stop_sequence: a.stop_sequence,
            agglength: a.agglength,
            list_refhr: a.list_refhr.iter().join(";"),
            cnt_trip_ids: a.cnt_trip_ids,
            all_obs: a.all_obs,
            avg_spd: a.avg_spd,
            spd_w: a.spd_w,
            avg_arrdif: a.avg_arrdif,
            arrd_w: a.arrd_w,
            prc_obs_sat: a.prc_obs_sat,
            prc_obs_uns: a.prc_obs_uns,
            prcw_sat: a.prcw_sat,
            prcw_uns: a.prcw_uns,
            act_sat_p: a.act_sat_p,
            act_uns_p: a.act_uns_p,
            x: a.x,
            y: a.y,
        }
    }
}

/// Write the aggregate tables, manifest, and any intermediate exports.
pub fn write_outputs(
    output: &RunOutput,
    main_folder: &Path,
    gtfs_date: &str,
    raw_date: &str,
) -> Result<()> {
    let analyses_dir = main_folder.join("6_analyses").join(gtfs_date);
    let requests_dir = main_folder.join("7_requests").join(gtfs_date);
    create_dir(&analyses_dir)?;
    create_dir(&requests_dir)?;

    let trip_stop: Vec<TripStopRecord> = output.trip_stop.iter().map(Into::into).collect();
    write_csv(&analyses_dir.join("general_aggregation.csv"), &trip_stop)?;

    write_csv(&requests_dir.join("hourly_aggregation.csv"), &output.hourly)?;

    let daily: Vec<DailyRecord> = output.daily.iter().map(Into::into).collect();
    write_csv(&requests_dir.join("daily_aggregation.csv"), &daily)?;

    let manifest_path = requests_dir.join("manifest.json");
    let file = fs::File::create(&manifest_path)
        .map_err(|e| OtpError::io(manifest_path.display().to_string(), e))?;
    serde_json::to_writer_pretty(file, &output.manifest).map_err(|e| OtpError::Io {
        path: manifest_path.display().to_string(),
        message: e.to_string(),
    })?;

    write_intermediates(output, main_folder, gtfs_date, raw_date)?;
    Ok(())
}

fn stage_path(
    main_folder: &Path,
    stage: &str,
    gtfs_date: &str,
    raw_date: &str,
    route: &str,
    suffix: &str,
) -> PathBuf {
    main_folder
        .join(stage)
        .join(gtfs_date)
        .join(format!("{}_{}_{}.csv", raw_date, route, suffix))
}

fn write_intermediates(
    output: &RunOutput,
    main_folder: &Path,
    gtfs_date: &str,
    raw_date: &str,
) -> Result<()> {
    for outcome in &output.outcomes {
        let Some(dump) = &outcome.intermediates else {
            continue;
        };
        let route = outcome.key.to_string();
        for stage in ["3_interim", "4_processed", "5_conformed"] {
            create_dir(&main_folder.join(stage).join(gtfs_date))?;
        }

        let path = |stage: &str, suffix: &str| {
            stage_path(main_folder, stage, gtfs_date, raw_date, &route, suffix)
        };
        write_csv(&path("3_interim", "located"), &dump.snapped)?;
        write_csv(&path("3_interim", "cleaned"), &dump.cleaned)?;
        write_csv(&path("4_processed", "processed"), &dump.enriched)?;
        write_csv(&path("5_conformed", "interpolated"), &dump.interpolated)?;
        write_csv(&path("5_conformed", "interpolated_cleaned"), &dump.refined)?;
    }
    Ok(())
}
