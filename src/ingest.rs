//! Fix-table ingestion: the harvester's daily CSV of vehicle positions.
//!
//! Timestamps arrive as RFC3339 (with offset or `Z`); the harvester's
//! older `YYYY-mm-dd HH:MM:SS` local format is accepted as a fallback
//! and interpreted in the schedule's clock.

use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::catalog::{RouteKey, ScheduleClock};
use crate::error::{OtpError, Result};
use crate::RawFix;

#[derive(Debug, Deserialize)]
struct FixRecord {
    trip_id: String,
    timestamp: String,
    lat: f64,
    lon: f64,
    #[serde(default)]
    vehicle_id: Option<String>,
}

/// Parse one fix timestamp into UTC.
pub fn parse_fix_timestamp(raw: &str, clock: &ScheduleClock) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(clock.naive_local_to_utc(naive));
    }
    Err(OtpError::Parse {
        message: format!("unparseable timestamp '{}'", raw),
    })
}

/// Read the day's fix table. Rows with invalid coordinates or
/// timestamps are dropped with a warning; a missing file aborts the job.
pub fn read_fix_table(path: &Path, clock: &ScheduleClock) -> Result<Vec<RawFix>> {
    if !path.exists() {
        return Err(OtpError::InputMissing {
            path: path.display().to_string(),
        });
    }
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| OtpError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    let mut fixes = Vec::new();
    let mut dropped = 0usize;
    for record in reader.deserialize::<FixRecord>() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                debug!("skipping malformed fix row: {}", e);
                dropped += 1;
                continue;
            }
        };
        let timestamp = match parse_fix_timestamp(&record.timestamp, clock) {
            Ok(t) => t,
            Err(e) => {
                debug!("skipping fix for trip {}: {}", record.trip_id, e);
                dropped += 1;
                continue;
            }
        };
        let fix = RawFix {
            trip_id: record.trip_id,
            timestamp,
            lon: record.lon,
            lat: record.lat,
            vehicle_id: record.vehicle_id,
        };
        if !fix.is_valid() {
            dropped += 1;
            continue;
        }
        fixes.push(fix);
    }
    if dropped > 0 {
        warn!("dropped {} unreadable fix rows from {}", dropped, path.display());
    }
    Ok(fixes)
}

/// Slice the day's fixes per route, sorted by `(trip_id, timestamp)`
/// within each slice. Returns the grouped fixes and the number of fixes
/// whose trip_id had no catalog entry.
pub fn group_by_route(
    fixes: Vec<RawFix>,
    trip_index: &HashMap<String, RouteKey>,
) -> (HashMap<RouteKey, Vec<RawFix>>, usize) {
    let mut grouped: HashMap<RouteKey, Vec<RawFix>> = HashMap::new();
    let mut unmatched = 0usize;
    for fix in fixes {
        match trip_index.get(&fix.trip_id) {
            Some(key) => grouped.entry(key.clone()).or_default().push(fix),
            None => unmatched += 1,
        }
    }
    for slice in grouped.values_mut() {
        slice.sort_by(|a, b| {
            a.trip_id
                .cmp(&b.trip_id)
                .then(a.timestamp.cmp(&b.timestamp))
        });
    }
    if unmatched > 0 {
        warn!("{} fixes referenced trips absent from the catalog", unmatched);
    }
    (grouped, unmatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Direction;
    use chrono::NaiveDate;

    fn clock() -> ScheduleClock {
        ScheduleClock::new(NaiveDate::from_ymd_opt(2021, 11, 20).unwrap(), -7 * 3600)
    }

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let t = parse_fix_timestamp("2021-11-20T15:42:42-07:00", &clock()).unwrap();
        assert_eq!(t.to_rfc3339(), "2021-11-20T22:42:42+00:00");
    }

    #[test]
    fn test_parse_naive_fallback_uses_schedule_clock() {
        let t = parse_fix_timestamp("2021-11-20 15:42:42", &clock()).unwrap();
        assert_eq!(t.to_rfc3339(), "2021-11-20T22:42:42+00:00");
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_fix_timestamp("yesterday-ish", &clock()).is_err());
    }

    #[test]
    fn test_group_by_route_sorts_and_counts_unmatched() {
        let clock = clock();
        let t0 = parse_fix_timestamp("2021-11-20 08:00:00", &clock).unwrap();
        let t1 = parse_fix_timestamp("2021-11-20 08:01:00", &clock).unwrap();
        let fixes = vec![
            RawFix {
                trip_id: "trip-b".to_string(),
                timestamp: t1,
                lon: -114.1,
                lat: 51.0,
                vehicle_id: None,
            },
            RawFix {
                trip_id: "trip-a".to_string(),
                timestamp: t0,
                lon: -114.1,
                lat: 51.0,
                vehicle_id: None,
            },
            RawFix {
                trip_id: "ghost".to_string(),
                timestamp: t0,
                lon: -114.1,
                lat: 51.0,
                vehicle_id: None,
            },
        ];
        let key = RouteKey::new("10", Direction::Outbound);
        let mut trip_index = HashMap::new();
        trip_index.insert("trip-a".to_string(), key.clone());
        trip_index.insert("trip-b".to_string(), key.clone());

        let (grouped, unmatched) = group_by_route(fixes, &trip_index);
        assert_eq!(unmatched, 1);
        let slice = &grouped[&key];
        assert_eq!(slice.len(), 2);
        assert_eq!(slice[0].trip_id, "trip-a");
        assert_eq!(slice[1].trip_id, "trip-b");
    }
}
