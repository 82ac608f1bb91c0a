//! `.funscript` loader: parses the JSON action list and works out which axis
//! a file belongs to from its name.
//!
//! `movie.funscript` drives the stroke; `movie.twist.funscript` or
//! `movie.R0.funscript` drives the twist, and likewise for roll and pitch.

use crate::types::{Axis, FunscriptAction, FunscriptData};
use log::{debug, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Channel suffixes used by multi-axis script packs that this engine does
/// not drive.
const UNSUPPORTED_SUFFIXES: &[&str] = &[
    "surge", "sway", "l1", "l2", "vib", "v0", "v1", "lube", "a0", "a1", "a2", "suck",
];

#[derive(Debug, Deserialize)]
struct RawScript {
    #[serde(default)]
    inverted: bool,
    actions: Vec<RawAction>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    at: f64,
    pos: f64,
}

/// Axis a script file drives, from its file name. `None` for files that are
/// not funscripts or that target a channel this engine does not drive.
pub fn axis_for_path(path: &Path) -> Option<Axis> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    let stem = name.strip_suffix(".funscript")?;
    let suffix = match stem.rsplit_once('.') {
        Some((_, suffix)) => suffix,
        None => return Some(Axis::Stroke),
    };
    if let Some(axis) = Axis::from_id(suffix) {
        return Some(axis);
    }
    if UNSUPPORTED_SUFFIXES.contains(&suffix) {
        return None;
    }
    // A dot that is part of the title, not a channel tag
    Some(Axis::Stroke)
}

/// Parse funscript JSON. Actions are sorted by time, positions clamped to
/// 0–100, and entries with non-finite fields dropped.
pub fn parse<R: Read>(reader: R, axis: Axis) -> Result<FunscriptData, String> {
    let raw: RawScript =
        serde_json::from_reader(reader).map_err(|e| format!("parse funscript: {}", e))?;

    let total = raw.actions.len();
    let mut actions: Vec<FunscriptAction> = raw
        .actions
        .into_iter()
        .filter(|a| a.at.is_finite() && a.pos.is_finite() && a.at >= 0.0)
        .map(|a| {
            let pos = a.pos.clamp(0.0, 100.0);
            let pos = if raw.inverted { 100.0 - pos } else { pos };
            FunscriptAction::new(a.at.round() as u64, pos)
        })
        .collect();
    if actions.len() < total {
        warn!(
            "{}: dropped {} malformed actions",
            axis,
            total - actions.len()
        );
    }
    actions.sort_by_key(|a| a.at);

    Ok(FunscriptData::new(axis, actions))
}

pub fn parse_str(json: &str, axis: Axis) -> Result<FunscriptData, String> {
    parse(json.as_bytes(), axis)
}

/// Load one file, inferring its axis from the name.
pub fn load(path: &Path) -> Result<FunscriptData, String> {
    let axis = axis_for_path(path)
        .ok_or_else(|| format!("{}: cannot map file name to an axis", path.display()))?;
    let file = File::open(path).map_err(|e| format!("open {}: {}", path.display(), e))?;
    let data = parse(BufReader::new(file), axis)
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    debug!(
        "Loaded {} actions for {} from {}",
        data.actions.len(),
        axis,
        path.display()
    );
    Ok(data)
}

/// Load several files into an axis-keyed map. A later file for the same
/// axis replaces an earlier one.
pub fn load_all<P: AsRef<Path>>(paths: &[P]) -> Result<HashMap<Axis, FunscriptData>, String> {
    let mut scripts = HashMap::new();
    for path in paths {
        let data = load(path.as_ref())?;
        if let Some(prev) = scripts.insert(data.axis, data) {
            warn!("Multiple scripts for {}; using the last one", prev.axis);
        }
    }
    Ok(scripts)
}
