use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::CompressionMethod;
use zip::write::FileOptions;

use crate::error::Result;

/// Zip a world file, or every `.world` file under a directory, into
/// `<name>_<timestamp>.zip` beside it. The sources are only read.
pub fn zip_backup(path: &Path) -> Result<PathBuf> {
    let meta = fs::metadata(path)?;
    let parent = path.parent().unwrap_or(Path::new("."));
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("world");
    let ts = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let dest = parent.join(format!("{}_{}.zip", name, ts));

    let (base, files): (&Path, Vec<PathBuf>) = if meta.is_dir() {
        let files = WalkDir::new(path)
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("world"))
            .collect();
        (path, files)
    } else {
        (parent, vec![path.to_path_buf()])
    };
    if files.is_empty() {
        return Err(io::Error::new(io::ErrorKind::NotFound, "no world files to back up").into());
    }

    let file = fs::File::create(&dest)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o644);
    for src in &files {
        let rel = src.strip_prefix(base).unwrap_or(src);
        let entry = rel.to_string_lossy().replace('\\', "/");
        zip.start_file(entry, options)?;
        let data = fs::read(src)?;
        zip.write_all(&data)?;
    }
    zip.finish()?;
    tracing::debug!(dest = %dest.display(), files = files.len(), "wrote world backup");
    Ok(dest)
}
