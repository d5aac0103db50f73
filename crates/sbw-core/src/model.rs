use std::fmt;

use crate::error::Result;
use crate::sbon::Dynamic;
use crate::world::WorldMetadata;

/// The fields dumped for each world: seed, spawn point, size and the three
/// template parameter blocks. `seed` and `size` must exist; the rest are
/// absent on some world kinds (instance worlds have no celestial block).
#[derive(Debug, Clone, PartialEq)]
pub struct WorldSummary<'a> {
    pub seed: &'a Dynamic,
    pub size: &'a Dynamic,
    pub spawn: Option<&'a Dynamic>,
    pub celestial: Option<&'a Dynamic>,
    pub sky: Option<&'a Dynamic>,
    pub world: Option<&'a Dynamic>,
}

impl<'a> WorldSummary<'a> {
    pub fn from_metadata(meta: &'a WorldMetadata) -> Result<Self> {
        Ok(Self {
            seed: meta.require("worldTemplate.seed")?,
            size: meta.require("worldTemplate.size")?,
            spawn: meta.get("playerStart"),
            celestial: meta.get("worldTemplate.celestialParameters"),
            sky: meta.get("worldTemplate.skyParameters"),
            world: meta.get("worldTemplate.worldParameters"),
        })
    }

    pub fn celestial_details(&self) -> CelestialDetails {
        CelestialDetails::from_summary(self)
    }
}

/// Descriptive fields of a planet, pulled loosely from a summary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CelestialDetails {
    pub seed: Option<i64>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub world_size: Option<String>,
    pub world_type: Option<String>,
    pub primary_biome: Option<String>,
    pub day_length: Option<f64>,
    pub threat_level: Option<f64>,
    pub planet_graphics: Option<Dynamic>,
}

impl CelestialDetails {
    pub fn from_summary(s: &WorldSummary<'_>) -> Self {
        let text = |v: Option<&Dynamic>, path: &str| {
            v.and_then(|v| v.pointer(path))
                .and_then(Dynamic::as_str)
                .map(str::to_owned)
        };
        let num = |v: Option<&Dynamic>, path: &str| v.and_then(|v| v.pointer(path)).and_then(Dynamic::as_f64);
        Self {
            seed: s.seed.as_i64(),
            name: text(s.celestial, "name"),
            description: text(s.celestial, "parameters.description"),
            world_size: text(s.celestial, "parameters.worldSize"),
            world_type: text(s.celestial, "parameters.worldType"),
            primary_biome: text(s.world, "primaryBiome"),
            day_length: num(s.world, "dayLength"),
            threat_level: num(s.world, "threatLevel"),
            planet_graphics: s.sky.and_then(|v| v.get("planet")).cloned(),
        }
    }

    /// Planet name with `^color;` markup removed.
    pub fn plain_name(&self) -> Option<String> {
        self.name.as_deref().map(strip_color_tags)
    }
}

/// Remove `^...;` formatting tags from game text.
pub fn strip_color_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text.trim();
    while let Some(start) = rest.find('^') {
        match rest[start..].find(';') {
            Some(end) => {
                out.push_str(&rest[..start]);
                rest = &rest[start + end + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CelestialCoordinate {
    pub x: i64,
    pub y: i64,
    pub system: i64,
    pub planet: u32,
    pub satellite: Option<u32>,
}

/// A world identified from its save file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WorldFile {
    /// `x_y_system_planet[_satellite].world`
    Celestial(CelestialCoordinate),
    /// `unique-<kind>-<uid>-<value>.world`; empty parts show as `-`
    Instance {
        kind: String,
        uid: String,
        value: String,
    },
}

impl WorldFile {
    /// Parse a bare file name or a path ending in one.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.rsplit(['/', '\\']).next()?.replace(':', "_");
        let stem = name.strip_suffix(".world")?;
        if let Some(rest) = stem.strip_prefix("unique-") {
            // kind, uid and value; uid and value may be empty
            let parts: Vec<&str> = rest.split('-').collect();
            let [kind, uid, value] = parts.as_slice() else {
                return None;
            };
            if kind.is_empty() {
                return None;
            }
            return Some(WorldFile::Instance {
                kind: kind.to_string(),
                uid: uid.to_string(),
                value: value.to_string(),
            });
        }
        let stem = stem.strip_prefix("CelestialWorld_").unwrap_or(stem);
        let parts: Vec<&str> = stem.split('_').collect();
        if !(4..=5).contains(&parts.len()) {
            return None;
        }
        Some(WorldFile::Celestial(CelestialCoordinate {
            x: parts[0].parse().ok()?,
            y: parts[1].parse().ok()?,
            system: parts[2].parse().ok()?,
            planet: parts[3].parse().ok()?,
            satellite: match parts.get(4) {
                Some(s) => Some(s.parse().ok()?),
                None => None,
            },
        }))
    }

    /// The in-game location string, e.g. `CelestialWorld:1:2:3:4`.
    pub fn whereami(&self) -> String {
        match self {
            WorldFile::Celestial(c) => {
                let mut s = format!("CelestialWorld:{}:{}:{}:{}", c.x, c.y, c.system, c.planet);
                if let Some(m) = c.satellite {
                    s.push_str(&format!(":{m}"));
                }
                s
            }
            WorldFile::Instance { kind, uid, value } => {
                let or_dash = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };
                format!("InstanceWorld:{kind}:{}:{}", or_dash(uid), or_dash(value))
            }
        }
    }

    pub fn file_name(&self) -> String {
        match self {
            WorldFile::Celestial(c) => {
                let mut s = format!("{}_{}_{}_{}", c.x, c.y, c.system, c.planet);
                if let Some(m) = c.satellite {
                    s.push_str(&format!("_{m}"));
                }
                s.push_str(".world");
                s
            }
            WorldFile::Instance { kind, uid, value } => format!("unique-{kind}-{uid}-{value}.world"),
        }
    }
}

impl fmt::Display for WorldFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.whereami())
    }
}
