// src/spots.rs
//
// Spot catalogue: polygons authored against a reference resolution,
// plus per-spot reservation and authorization metadata.

use crate::types::{Point, Resolution, Spot};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

#[derive(Debug, Deserialize)]
struct SpotsFile {
    spots: Vec<SpotEntry>,
    #[serde(default)]
    reference_size: Option<Resolution>,
}

#[derive(Debug, Deserialize)]
struct SpotEntry {
    name: String,
    points: Vec<Point>,
    #[serde(default)]
    reserved: bool,
    #[serde(default)]
    authorized_plates: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct SpotLayout {
    pub spots: Vec<Spot>,
    pub reference_size: Option<Resolution>,
}

impl SpotLayout {
    pub fn get(&self, name: &str) -> Option<&Spot> {
        self.spots.iter().find(|s| s.name == name)
    }

    /// Exact match first, then case-insensitive. Surrounding whitespace is ignored.
    pub fn resolve_spot_name(&self, raw: &str) -> Option<&str> {
        let target = raw.trim();
        if target.is_empty() {
            return None;
        }
        if let Some(spot) = self.get(target) {
            return Some(&spot.name);
        }
        let lower = target.to_lowercase();
        self.spots
            .iter()
            .find(|s| s.name.to_lowercase() == lower)
            .map(|s| s.name.as_str())
    }
}

pub fn load_spots(path: &Path) -> Result<SpotLayout> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Spots file not found: {}", path.display()))?;
    let layout = parse_spots(&contents)
        .with_context(|| format!("Invalid spots file: {}", path.display()))?;

    info!(
        "Loaded {} spot(s) from {} (reference size: {})",
        layout.spots.len(),
        path.display(),
        layout
            .reference_size
            .map(|r| format!("{}x{}", r.width, r.height))
            .unwrap_or_else(|| "none".to_string())
    );

    Ok(layout)
}

pub fn parse_spots(contents: &str) -> Result<SpotLayout> {
    let file: SpotsFile = serde_json::from_str(contents)?;

    let mut seen = HashSet::new();
    let mut spots = Vec::with_capacity(file.spots.len());

    for entry in file.spots {
        if !seen.insert(entry.name.clone()) {
            bail!("Duplicate spot name: {}", entry.name);
        }
        if entry.points.len() < 3 {
            bail!(
                "Spot {} has {} point(s), a polygon needs at least 3",
                entry.name,
                entry.points.len()
            );
        }
        spots.push(Spot {
            name: entry.name,
            polygon: entry.points,
            reserved: entry.reserved,
            authorized_plates: entry.authorized_plates.unwrap_or_default(),
        });
    }

    if let Some(r) = file.reference_size {
        if r.width == 0 || r.height == 0 {
            bail!("reference_size must be non-zero, got {}x{}", r.width, r.height);
        }
    }

    Ok(SpotLayout {
        spots,
        reference_size: file.reference_size,
    })
}
