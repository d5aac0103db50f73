use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::{Args as ClapArgs, Parser, Subcommand};
use sbw_core::json::{self, JsonOpts};
use sbw_core::{RecordLocation, RegionKey, WorldSummary, open_world};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sbw-cli",
    about = "Dump Starbound world metadata as JSON",
    version,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    /// World file to summarise; prints `{}` when omitted
    path: Option<PathBuf>,
    /// Log decoding steps to stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Print the seed/spawn/size/celestial/sky/world summary
    Summary(DumpArgs),
    /// Print the whole metadata record
    Metadata(DumpArgs),
    /// Print one metadata field by dotted path
    Get(GetArgs),
    /// List record keys stored in the world
    Keys(KeysArgs),
    /// Print container header and block statistics
    Info(PathArgs),
    /// Summarise every .world file under a directory
    Dir(PathArgs),
    /// Dump an SBVJ01 file (players, ships)
    Sbvj(DumpArgs),
    /// Write `<world>.json` with the summary next to the world file
    Export(ExportArgs),
    /// Zip a world file or directory of worlds with a timestamped name
    Backup(PathArgs),
}

#[derive(ClapArgs, Debug)]
struct PathArgs {
    path: PathBuf,
}

#[derive(ClapArgs, Debug)]
struct DumpArgs {
    path: PathBuf,
    /// Pretty-print the JSON
    #[arg(long, default_value_t = false)]
    pretty: bool,
    /// Max array elements to include per array
    #[arg(long, default_value_t = 4096)]
    max_array: usize,
    /// Max recursion depth
    #[arg(long, default_value_t = 64)]
    max_depth: usize,
}

#[derive(ClapArgs, Debug)]
struct GetArgs {
    path: PathBuf,
    /// Dotted path, e.g. worldTemplate.seed
    #[arg(long)]
    field: String,
}

#[derive(ClapArgs, Debug)]
struct KeysArgs {
    path: PathBuf,
    /// Only keys of this layer (0 metadata, 1 tiles, 2 entities)
    #[arg(long)]
    layer: Option<u8>,
}

#[derive(ClapArgs, Debug)]
struct ExportArgs {
    path: PathBuf,
    /// Replace an existing export
    #[arg(long, default_value_t = false)]
    overwrite: bool,
}

/// Everything a dump needs, resolved from the command line.
#[derive(Debug, Clone)]
struct DumpConfig {
    path: Option<PathBuf>,
    pretty: bool,
    opts: JsonOpts,
}

impl From<DumpArgs> for DumpConfig {
    fn from(a: DumpArgs) -> Self {
        Self {
            path: Some(a.path),
            pretty: a.pretty,
            opts: JsonOpts {
                max_array_elems: a.max_array,
                max_depth: a.max_depth,
            },
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if let Err(e) = run(cli, &mut out) {
        eprintln!("error: {:#}", e);
        std::process::exit(exit_code(&e));
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "sbw_core=debug,sbw_cli=debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .init();
}

/// 2: open/parse failure, 3: missing field or record, 4: output failure.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<sbw_core::Error>() {
        Some(sbw_core::Error::FieldNotFound(_) | sbw_core::Error::KeyNotFound(_)) => 3,
        Some(_) => 2,
        None if err.downcast_ref::<io::Error>().is_some() => 4,
        None => 2,
    }
}

fn run(cli: Cli, out: &mut dyn Write) -> anyhow::Result<()> {
    let Some(cmd) = cli.cmd else {
        let cfg = DumpConfig {
            path: cli.path,
            pretty: false,
            opts: JsonOpts::default(),
        };
        return cmd_summary(&cfg, out);
    };
    tracing::debug!(command = ?cmd, "dispatching");
    match cmd {
        Cmd::Summary(a) => cmd_summary(&a.into(), out),
        Cmd::Metadata(a) => cmd_metadata(&a.into(), out),
        Cmd::Get(a) => cmd_get(&a, out),
        Cmd::Keys(a) => cmd_keys(&a, out),
        Cmd::Info(a) => cmd_info(&a.path, out),
        Cmd::Dir(a) => emit(out, &json::dump_dir_map_json(&a.path), true),
        Cmd::Sbvj(a) => cmd_sbvj(&a.into(), out),
        Cmd::Export(a) => {
            let p = json::export_summary_json(&a.path, a.overwrite)?;
            writeln!(out, "{}", p.display())?;
            Ok(())
        }
        Cmd::Backup(a) => {
            let p = sbw_core::backup::zip_backup(&a.path)?;
            writeln!(out, "{}", p.display())?;
            Ok(())
        }
    }
}

fn emit(out: &mut dyn Write, v: &serde_json::Value, pretty: bool) -> anyhow::Result<()> {
    let s = if pretty {
        serde_json::to_string_pretty(v)?
    } else {
        serde_json::to_string(v)?
    };
    writeln!(out, "{}", s)?;
    Ok(())
}

fn cmd_summary(cfg: &DumpConfig, out: &mut dyn Write) -> anyhow::Result<()> {
    let Some(path) = &cfg.path else {
        writeln!(out, "{{}}")?;
        return Ok(());
    };
    let reader = open_world(path)?;
    let summary = WorldSummary::from_metadata(reader.read_metadata()?)?;
    emit(out, &json::summary_to_json(&summary), cfg.pretty)
}

fn cmd_metadata(cfg: &DumpConfig, out: &mut dyn Write) -> anyhow::Result<()> {
    let path = cfg.path.as_deref().context("missing world path")?;
    let reader = open_world(path)?;
    let v = json::metadata_to_json(reader.read_metadata()?, cfg.opts);
    emit(out, &v, cfg.pretty)
}

fn cmd_get(args: &GetArgs, out: &mut dyn Write) -> anyhow::Result<()> {
    let reader = open_world(&args.path)?;
    let meta = reader.read_metadata()?;
    let v = meta.require(&args.field)?;
    emit(out, &json::dynamic_to_json(v, JsonOpts::unlimited()), true)
}

fn cmd_keys(args: &KeysArgs, out: &mut dyn Write) -> anyhow::Result<()> {
    let reader = open_world(&args.path)?;
    let entries: Box<dyn Iterator<Item = sbw_core::Result<(RegionKey, RecordLocation)>> + '_> =
        match args.layer {
            Some(layer) => Box::new(reader.region_entries(layer)),
            None => Box::new(reader.tree().entries().filter_map(|r| match r {
                Ok(e) => RegionKey::from_bytes(&e.key).map(|k| Ok((k, e.location))),
                Err(e) => Some(Err(e)),
            })),
        };
    for entry in entries {
        let (key, loc) = entry?;
        writeln!(out, "{}\t{}\t{}\t{}", key.layer, key.x, key.y, loc.length)?;
    }
    Ok(())
}

fn cmd_info(path: &Path, out: &mut dyn Write) -> anyhow::Result<()> {
    let reader = open_world(path)?;
    let header = reader.header();
    let root = header.active_root();
    let stats = reader.tree().block_stats()?;
    let meta = reader.read_metadata()?;
    let v = serde_json::json!({
        "identifier": header.content_identifier,
        "blockSize": header.block_size,
        "keySize": header.key_size,
        "rootBlock": root.root_block,
        "rootIsLeaf": root.root_is_leaf,
        "blocks": {
            "total": stats.total(),
            "index": stats.index,
            "leaf": stats.leaf,
            "free": stats.free,
            "unknown": stats.unknown,
        },
        "width": meta.width,
        "height": meta.height,
        "metadataVersion": meta.version,
    });
    emit(out, &v, true)
}

fn cmd_sbvj(cfg: &DumpConfig, out: &mut dyn Write) -> anyhow::Result<()> {
    let path = cfg.path.as_deref().context("missing file path")?;
    let region = sbw_core::ByteRegion::map_file(path)?;
    let doc = sbw_core::read_sbvj01(region.as_bytes())
        .with_context(|| format!("reading {}", path.display()))?;
    emit(out, &json::document_to_json(&doc, cfg.opts), cfg.pretty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbw_core::fixture::world_image;
    use sbw_core::{Dynamic, DynamicMap};

    fn sample_world(dir: &Path) -> PathBuf {
        let template: DynamicMap = [
            ("seed", Dynamic::Int(1234)),
            ("size", Dynamic::List(vec![Dynamic::Int(3000), Dynamic::Int(2000)])),
        ]
        .into_iter()
        .collect();
        let meta: DynamicMap = [
            ("playerStart", Dynamic::List(vec![Dynamic::Float(10.5), Dynamic::Float(20.0)])),
            ("worldTemplate", Dynamic::Map(template)),
        ]
        .into_iter()
        .collect();
        let p = dir.join("1_2_3_4.world");
        std::fs::write(&p, world_image(3000, 2000, &Dynamic::Map(meta)).unwrap()).unwrap();
        p
    }

    fn run_to_string(args: &[&str]) -> anyhow::Result<String> {
        let cli = Cli::try_parse_from(args)?;
        let mut buf = Vec::new();
        run(cli, &mut buf)?;
        Ok(String::from_utf8(buf).unwrap())
    }

    #[test]
    fn no_argument_prints_empty_object() {
        assert_eq!(run_to_string(&["sbw-cli"]).unwrap(), "{}\n");
    }

    #[test]
    fn positional_path_prints_one_line_summary() {
        let dir = tempfile::tempdir().unwrap();
        let p = sample_world(dir.path());
        let s = run_to_string(&["sbw-cli", p.to_str().unwrap()]).unwrap();
        assert_eq!(s.lines().count(), 1);
        let v: serde_json::Value = serde_json::from_str(&s).unwrap();
        assert_eq!(v["seed"], serde_json::json!(1234));
        assert_eq!(v["size"], serde_json::json!([3000, 2000]));
        assert_eq!(v["spawn"], serde_json::json!([10.5, 20.0]));
        assert!(v["celestial"].is_null());
    }

    #[test]
    fn get_missing_field_maps_to_exit_code_3() {
        let dir = tempfile::tempdir().unwrap();
        let p = sample_world(dir.path());
        let err = run_to_string(&["sbw-cli", "get", p.to_str().unwrap(), "--field", "nope.x"])
            .unwrap_err();
        assert_eq!(exit_code(&err), 3);
    }

    #[test]
    fn bad_file_maps_to_exit_code_2() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("junk.world");
        std::fs::write(&p, vec![0u8; 600]).unwrap();
        let err = run_to_string(&["sbw-cli", "summary", p.to_str().unwrap()]).unwrap_err();
        assert_eq!(exit_code(&err), 2);
    }

    #[test]
    fn keys_lists_metadata_record() {
        let dir = tempfile::tempdir().unwrap();
        let p = sample_world(dir.path());
        let s = run_to_string(&["sbw-cli", "keys", p.to_str().unwrap(), "--layer", "0"]).unwrap();
        let first = s.lines().next().unwrap();
        assert!(first.starts_with("0\t0\t0\t"));
    }

    #[test]
    fn keys_filters_by_layer() {
        use sbw_core::fixture::{ContainerBuilder, metadata_record};
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("layers.world");
        let meta = Dynamic::Map(DynamicMap::new());
        let mut b = ContainerBuilder::world().leaf_fanout(2).index_fanout(3);
        b.insert(RegionKey::METADATA.to_bytes(), metadata_record(8, 8, &meta).unwrap());
        for x in 0..4u16 {
            b.insert(RegionKey::new(1, x, 0).to_bytes(), vec![0u8; 3]);
            b.insert(RegionKey::new(2, x, 1).to_bytes(), vec![0u8; 7]);
        }
        std::fs::write(&p, b.build()).unwrap();

        let tiles = run_to_string(&["sbw-cli", "keys", p.to_str().unwrap(), "--layer", "1"]).unwrap();
        let lines: Vec<&str> = tiles.lines().collect();
        assert_eq!(lines, ["1\t0\t0\t3", "1\t1\t0\t3", "1\t2\t0\t3", "1\t3\t0\t3"]);

        let all = run_to_string(&["sbw-cli", "keys", p.to_str().unwrap()]).unwrap();
        assert_eq!(all.lines().count(), 9);
        assert!(all.lines().last().unwrap().starts_with("2\t3\t1\t7"));
    }

    #[test]
    fn dir_dump_includes_whereami() {
        let dir = tempfile::tempdir().unwrap();
        sample_world(dir.path());
        let s = run_to_string(&["sbw-cli", "dir", dir.path().to_str().unwrap()]).unwrap();
        let v: serde_json::Value = serde_json::from_str(&s).unwrap();
        assert_eq!(
            v["1_2_3_4.world"]["$whereami"],
            serde_json::json!("CelestialWorld:1:2:3:4")
        );
    }
}
