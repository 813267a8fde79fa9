//! mrtidx — offline sparse-index builder for catalog blobs.
//!
//! Reads catalog blobs produced by the archive server, walks each indexed
//! file to sample a sparse offset table, and writes the enriched catalog
//! back out. Per-file failures are logged and skipped; the tool only exits
//! non-zero when a blob itself cannot be read or written.

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use mrtscope_server::catalog::TimeEntrySlice;
use mrtscope_server::error::ArchiveError;
use mrtscope_server::mrt::CommonHeader;
use mrtscope_server::scan::open_records;
use mrtscope_server::sparse::{build_offsets, DEFAULT_SAMPLE_RATE};
use mrtscope_server::types::ArchEntry;

/// Build sparse per-file indexes for archive catalog blobs.
#[derive(Parser)]
#[command(name = "mrtidx", version, about)]
struct Cli {
    /// Catalog blob paths
    #[arg(required = true)]
    blobs: Vec<PathBuf>,

    /// Suffix appended to the output catalog filename
    #[arg(short = 'o', long = "outsuffix", default_value = "")]
    outsuffix: String,

    /// Sample rate in (0, 1]
    #[arg(short = 'r', long, default_value_t = DEFAULT_SAMPLE_RATE)]
    rate: f64,

    /// Dump catalog entries to stdout instead of writing indexes
    #[arg(short = 'p', long)]
    print: bool,

    /// Output as JSON instead of human-readable text when printing
    #[arg(long)]
    json: bool,

    /// Rewrite the entries' common base directory to this path
    #[arg(long)]
    bp: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mrtidx=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut failed = false;
    for blob in &cli.blobs {
        if let Err(e) = process_blob(blob, &cli) {
            error!(blob = %blob.display(), error = %e, "blob failed");
            failed = true;
        }
    }
    std::process::exit(if failed { 1 } else { 0 });
}

fn process_blob(blob: &Path, cli: &Cli) -> Result<(), ArchiveError> {
    let catalog = TimeEntrySlice::from_blob(blob)?;

    if cli.print {
        print_catalog(&catalog, cli.json);
        return Ok(());
    }

    let mut entries: Vec<ArchEntry> = catalog.entries().to_vec();
    let mut indexed = 0usize;
    for entry in &mut entries {
        match open_records(&entry.path) {
            Ok(mut records) => {
                entry.offsets =
                    Some(build_offsets(&mut records, entry.size, cli.rate, &by_timestamp));
                indexed += 1;
            }
            Err(e) => {
                warn!(file = %entry.path.display(), error = %e, "cannot open file, skipping");
            }
        }
    }

    if let Some(bp) = &cli.bp {
        rebase_entries(&mut entries, bp);
    }

    let out = output_path(blob, &cli.outsuffix);
    TimeEntrySlice::from_entries(entries).to_blob(&out)?;
    info!(blob = %out.display(), files = indexed, "catalog written");
    Ok(())
}

fn by_timestamp(raw: &[u8]) -> Result<i64, ArchiveError> {
    CommonHeader::parse(raw).map(|h| i64::from(h.timestamp))
}

fn print_catalog(catalog: &TimeEntrySlice, json: bool) {
    if json {
        let items: Vec<serde_json::Value> = catalog
            .entries()
            .iter()
            .map(|e| {
                serde_json::json!({
                    "path": e.path.display().to_string(),
                    "sdate": e.sdate.to_rfc3339(),
                    "size": e.size,
                    "offsets": e.offsets.as_ref().map(|o| o.len()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items).expect("catalog entries serialize"));
    } else {
        for e in catalog.entries() {
            let slots = e.offsets.as_ref().map(|o| o.len()).unwrap_or(0);
            println!("{}  {}  {:>12}  {:>3} offsets", e.sdate, e.path.display(), e.size, slots);
        }
        eprintln!("\n{} entries", catalog.len());
    }
}

// ---------------------------------------------------------------------------
// Base-path rewrite (--bp)
// ---------------------------------------------------------------------------

/// Replace the entries' longest common ancestor directory with `bp`,
/// preserving each entry's relative subpath.
fn rebase_entries(entries: &mut [ArchEntry], bp: &Path) {
    let Some(base) = common_base(entries) else { return };
    for entry in entries.iter_mut() {
        if let Ok(rel) = entry.path.strip_prefix(&base) {
            entry.path = bp.join(rel);
        }
    }
}

fn common_base(entries: &[ArchEntry]) -> Option<PathBuf> {
    let mut iter = entries.iter();
    let mut base = iter.next()?.path.parent()?.to_path_buf();
    for e in iter {
        while !e.path.starts_with(&base) {
            base = base.parent()?.to_path_buf();
        }
    }
    Some(base)
}

fn output_path(blob: &Path, suffix: &str) -> PathBuf {
    if suffix.is_empty() {
        blob.to_path_buf()
    } else {
        PathBuf::from(format!("{}{suffix}", blob.display()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(path: &str) -> ArchEntry {
        ArchEntry::new(path.into(), Utc::now(), 1)
    }

    #[test]
    fn rebase_preserves_relative_structure() {
        let mut entries = vec![
            entry("/mnt/old/rv2/2013.01/updates.a"),
            entry("/mnt/old/rv2/2013.02/updates.b"),
        ];
        rebase_entries(&mut entries, Path::new("/srv/archive"));
        assert_eq!(entries[0].path, Path::new("/srv/archive/2013.01/updates.a"));
        assert_eq!(entries[1].path, Path::new("/srv/archive/2013.02/updates.b"));
    }

    #[test]
    fn common_base_spans_divergent_parents() {
        let entries = vec![entry("/data/a/x/f1"), entry("/data/b/f2")];
        assert_eq!(common_base(&entries), Some(PathBuf::from("/data")));
    }

    #[test]
    fn output_path_appends_suffix() {
        assert_eq!(output_path(Path::new("/tmp/blob"), ""), PathBuf::from("/tmp/blob"));
        assert_eq!(output_path(Path::new("/tmp/blob"), ".idx"), PathBuf::from("/tmp/blob.idx"));
    }
}
