use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value as J, json};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::model::{WorldFile, WorldSummary};
use crate::sbon::{Dynamic, VersionedDocument};
use crate::world::{WorldMetadata, open_world};

#[derive(Clone, Copy, Debug)]
pub struct JsonOpts {
    pub max_array_elems: usize,
    pub max_depth: usize,
}

impl Default for JsonOpts {
    fn default() -> Self {
        Self {
            max_array_elems: 4096,
            max_depth: 64,
        }
    }
}

impl JsonOpts {
    /// No truncation at all.
    pub fn unlimited() -> Self {
        Self {
            max_array_elems: usize::MAX,
            max_depth: usize::MAX,
        }
    }
}

pub fn dynamic_to_json(v: &Dynamic, opts: JsonOpts) -> J {
    write_value(v, 0, &opts)
}

fn write_value(v: &Dynamic, depth: usize, opts: &JsonOpts) -> J {
    match v {
        Dynamic::Null => J::Null,
        Dynamic::Bool(b) => J::Bool(*b),
        Dynamic::Int(n) => json!(*n),
        // NaN and infinities have no JSON form.
        Dynamic::Float(f) => serde_json::Number::from_f64(*f)
            .map(J::Number)
            .unwrap_or(J::Null),
        Dynamic::String(s) => J::String(s.clone()),
        Dynamic::List(items) => {
            let max = opts.max_array_elems.min(items.len());
            let mut arr = Vec::with_capacity(max + 1);
            for it in items.iter().take(max) {
                if depth >= opts.max_depth {
                    arr.push(J::Null);
                } else {
                    arr.push(write_value(it, depth + 1, opts));
                }
            }
            if items.len() > max {
                arr.push(json!({"$truncated": true, "$omitted": items.len() - max}));
            }
            J::Array(arr)
        }
        Dynamic::Map(m) => {
            let mut map = Map::with_capacity(m.len());
            for (k, val) in m.iter() {
                let vv = if depth >= opts.max_depth {
                    J::Null
                } else {
                    write_value(val, depth + 1, opts)
                };
                map.insert(k.to_string(), vv);
            }
            J::Object(map)
        }
    }
}

pub fn summary_to_json(s: &WorldSummary<'_>) -> J {
    let opt = |v: Option<&Dynamic>| v.map_or(J::Null, |v| dynamic_to_json(v, JsonOpts::unlimited()));
    json!({
        "seed": dynamic_to_json(s.seed, JsonOpts::unlimited()),
        "spawn": opt(s.spawn),
        "size": dynamic_to_json(s.size, JsonOpts::unlimited()),
        "celestial": opt(s.celestial),
        "sky": opt(s.sky),
        "world": opt(s.world),
    })
}

pub fn metadata_to_json(meta: &WorldMetadata, opts: JsonOpts) -> J {
    let mut map = Map::new();
    map.insert("$identifier".into(), json!(meta.identifier));
    map.insert("$version".into(), json!(meta.version));
    map.insert("width".into(), json!(meta.width));
    map.insert("height".into(), json!(meta.height));
    map.insert(
        "metadata".into(),
        dynamic_to_json(&Dynamic::Map(meta.data.clone()), opts),
    );
    J::Object(map)
}

pub fn document_to_json(doc: &VersionedDocument, opts: JsonOpts) -> J {
    json!({
        "$identifier": doc.identifier,
        "$version": doc.version,
        "content": dynamic_to_json(&doc.content, opts),
    })
}

/// Summary object for one world file.
pub fn summary_json(path: &Path) -> Result<J> {
    let reader = open_world(path)?;
    let meta = reader.read_metadata()?;
    let summary = WorldSummary::from_metadata(meta)?;
    Ok(summary_to_json(&summary))
}

pub fn metadata_json(path: &Path, opts: JsonOpts) -> Result<J> {
    let reader = open_world(path)?;
    Ok(metadata_to_json(reader.read_metadata()?, opts))
}

/// Write `<world>.json` next to the world file and return its path. An
/// existing export is kept unless `overwrite` is set.
pub fn export_summary_json(path: &Path, overwrite: bool) -> Result<PathBuf> {
    let mut out = path.as_os_str().to_owned();
    out.push(".json");
    let out = PathBuf::from(out);
    if !overwrite && out.exists() {
        return Ok(out);
    }
    let v = summary_json(path)?;
    let text = serde_json::to_string(&v).map_err(|e| Error::Io(e.into()))?;
    fs::write(&out, text)?;
    tracing::debug!(world = %path.display(), out = %out.display(), "exported summary");
    Ok(out)
}

pub fn find_world_files(dir: &Path) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("world"))
        .collect();
    out.sort();
    out
}

/// File name → summary for every world under `dir`. Worlds that fail to
/// read map to `{"$error": ...}`.
pub fn dump_dir_map_json(dir: &Path) -> J {
    let mut map = Map::new();
    for f in find_world_files(dir) {
        let name = f
            .strip_prefix(dir)
            .unwrap_or(&f)
            .to_string_lossy()
            .replace('\\', "/");
        let entry = match summary_json(&f) {
            Ok(mut v) => {
                if let (Some(obj), Some(wf)) = (v.as_object_mut(), WorldFile::parse(&name)) {
                    obj.insert("$whereami".into(), json!(wf.whereami()));
                }
                v
            }
            Err(e) => {
                tracing::warn!(file = %f.display(), error = %e, "skipping unreadable world");
                json!({"$error": e.to_string()})
            }
        };
        map.insert(name, entry);
    }
    J::Object(map)
}
