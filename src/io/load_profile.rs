//! Load-profile CSV reader.
//!
//! Profiles come as `time,P,Q` rows (kW / kVAr, scaled to W / VAr here) or as
//! `time,WF` weighting-factor rows. An optional header row is detected by a
//! non-digit first character. Time is either plain seconds or `HH:MM:SS`,
//! selected by [`TimeFormat`]. Profiles are matched to loads either by
//! normalized file name (AUTO) or through an explicit assignment map
//! (MANUAL); unmatched files are logged and skipped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeFormat {
    Seconds,
    HhMmSs,
}

/// How profile files are matched to load names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssignMode {
    /// Match by uppercased, alphanumeric-only file stem.
    Auto,
    /// Explicit load-name to file-name map.
    Manual(HashMap<String, String>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileEntry {
    pub time: f64,
    /// Active power in W.
    pub p: f64,
    /// Reactive power in VAr.
    pub q: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LoadProfile {
    pub entries: Vec<ProfileEntry>,
    /// Weighting factors, used instead of `entries` by the two-column form.
    pub weighting_factors: Vec<(f64, f64)>,
}

impl LoadProfile {
    /// Linear interpolation of P and Q at `time`; clamps outside the profile.
    pub fn interpolate(&self, time: f64) -> (f64, f64) {
        let entries = &self.entries;
        if entries.is_empty() {
            return (0.0, 0.0);
        }
        if time <= entries[0].time {
            return (entries[0].p, entries[0].q);
        }
        if let Some(last) = entries.last() {
            if time >= last.time {
                return (last.p, last.q);
            }
        }
        let pos = entries.partition_point(|e| e.time <= time);
        let (a, b) = (&entries[pos - 1], &entries[pos]);
        let w = (time - a.time) / (b.time - a.time);
        (a.p + w * (b.p - a.p), a.q + w * (b.q - a.q))
    }
}

/// Converts `HH:MM:SS` (or `HH:MM`) into seconds.
fn time_format_convert(time: &str) -> Result<f64> {
    let parts: Vec<&str> = time.split(':').collect();
    if parts.len() < 2 {
        return Err(Error::Config(format!("malformed time field `{time}`")));
    }
    let mut secs = 0.0;
    for (unit, part) in [3600.0, 60.0, 1.0].iter().zip(&parts) {
        let v: f64 = part
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("malformed time field `{time}`")))?;
        secs += unit * v;
    }
    Ok(secs)
}

fn parse_time(field: &str, format: TimeFormat) -> Result<f64> {
    match format {
        TimeFormat::Seconds => field
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("malformed time field `{field}`"))),
        TimeFormat::HhMmSs => time_format_convert(field),
    }
}

/// Reads one profile file.
pub fn read_profile(path: &Path, format: TimeFormat) -> Result<LoadProfile> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut profile = LoadProfile::default();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let Some(first) = record.get(0) else {
            continue;
        };
        // Header rows start with a non-digit character.
        if row == 0 && first.chars().next().is_some_and(|c| !c.is_ascii_digit()) {
            continue;
        }
        let time = parse_time(first, format)?;
        match record.len() {
            2 => {
                let wf: f64 = record[1]
                    .parse()
                    .map_err(|_| Error::Config(format!("malformed weighting factor in {path:?}")))?;
                profile.weighting_factors.push((time, wf));
            }
            3 => {
                let p: f64 = record[1]
                    .parse()
                    .map_err(|_| Error::Config(format!("malformed P field in {path:?}")))?;
                let q: f64 = record[2]
                    .parse()
                    .map_err(|_| Error::Config(format!("malformed Q field in {path:?}")))?;
                profile.entries.push(ProfileEntry {
                    time,
                    p: p * 1000.0,
                    q: q * 1000.0,
                });
            }
            _ => {
                return Err(Error::Config(format!(
                    "unexpected column count {} in {path:?}",
                    record.len()
                )))
            }
        }
    }
    Ok(profile)
}

/// Uppercased alphanumeric token of a load name or file stem; the `.csv`
/// suffix of files is dropped before normalization.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Reads all profiles in `dir` and assigns them to the given load names.
/// Returns the matched profiles; unmatched files are skipped with a warning.
pub fn assign_profiles(
    dir: &Path,
    load_names: &[&str],
    mode: &AssignMode,
    format: TimeFormat,
) -> Result<HashMap<String, LoadProfile>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut assigned = HashMap::new();
    for file in files {
        let stem = file
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();

        let matched = match mode {
            AssignMode::Auto => {
                let token = normalize(stem);
                load_names
                    .iter()
                    .find(|name| normalize(name) == token)
                    .map(|name| (*name).to_owned())
            }
            AssignMode::Manual(map) => {
                let file_name = file
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default();
                map.iter()
                    .find(|(_, assigned_file)| {
                        assigned_file.as_str() == file_name || assigned_file.as_str() == stem
                    })
                    .map(|(load, _)| load.clone())
            }
        };

        match matched {
            Some(load) => {
                debug!(file = %file.display(), load = %load, "assigned profile");
                assigned.insert(load, read_profile(&file, format)?);
            }
            None => warn!(file = %file.display(), "no load matches profile file, skipping"),
        }
    }
    Ok(assigned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("rustdyn_profiles_{tag}_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn reads_pq_rows_with_header_and_scales_to_watts() {
        let dir = temp_dir("pq");
        let path = write_temp(&dir, "Load1.csv", "time,P,Q\n0,1.0,0.5\n1,2.0,1.0\n");
        let profile = read_profile(&path, TimeFormat::Seconds).unwrap();
        assert_eq!(profile.entries.len(), 2);
        assert_eq!(profile.entries[0].p, 1000.0);
        assert_eq!(profile.entries[1].q, 1000.0);
    }

    #[test]
    fn interpolates_between_grid_points() {
        let profile = LoadProfile {
            entries: vec![
                ProfileEntry { time: 0.0, p: 1000.0, q: 0.0 },
                ProfileEntry { time: 2.0, p: 3000.0, q: 500.0 },
            ],
            weighting_factors: Vec::new(),
        };
        let (p, q) = profile.interpolate(1.0);
        assert_eq!(p, 2000.0);
        assert_eq!(q, 250.0);
        assert_eq!(profile.interpolate(5.0).0, 3000.0);
    }

    #[test]
    fn parses_hh_mm_ss_times() {
        assert_eq!(time_format_convert("01:30:30").unwrap(), 5430.0);
        assert_eq!(time_format_convert("00:01").unwrap(), 60.0);
        assert!(time_format_convert("oops").is_err());
    }

    #[test]
    fn reads_weighting_factor_rows() {
        let dir = temp_dir("wf");
        let path = write_temp(&dir, "wf.csv", "0,0.5\n60,0.75\n");
        let profile = read_profile(&path, TimeFormat::Seconds).unwrap();
        assert_eq!(profile.weighting_factors, vec![(0.0, 0.5), (60.0, 0.75)]);
        assert!(profile.entries.is_empty());
    }

    #[test]
    fn auto_mode_matches_normalized_names() {
        let dir = temp_dir("auto");
        write_temp(&dir, "load_H1.csv", "0,1.0,0.0\n");
        write_temp(&dir, "unrelated.csv", "0,9.0,0.0\n");
        let assigned =
            assign_profiles(&dir, &["Load H-1"], &AssignMode::Auto, TimeFormat::Seconds).unwrap();
        assert_eq!(assigned.len(), 1);
        assert!(assigned.contains_key("Load H-1"));
    }

    #[test]
    fn manual_mode_uses_the_assignment_map() {
        let dir = temp_dir("manual");
        write_temp(&dir, "profile_a.csv", "0,1.0,0.0\n");
        let mut map = HashMap::new();
        map.insert("house7".to_owned(), "profile_a.csv".to_owned());
        let assigned =
            assign_profiles(&dir, &["house7"], &AssignMode::Manual(map), TimeFormat::Seconds)
                .unwrap();
        assert!(assigned.contains_key("house7"));
    }
}
