//! Filesystem scanner: walks a collector's capture tree and builds a staging
//! catalog from each admitted file's first-record timestamp.
//!
//! Directories named `YYYY.MM` are year-month directories; during an
//! incremental rescan, months strictly older than the newest indexed entry
//! are pruned from the walk entirely. A file is admitted only when its path
//! contains the archive's discriminator substring (e.g. "updates" vs "ribs").

use chrono::{DateTime, Datelike, Utc};
use ignore::WalkBuilder;
use rayon::prelude::*;
use regex::Regex;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::catalog::TimeEntrySlice;
use crate::error::ArchiveError;
use crate::mrt::{CommonHeader, RecordReader};
use crate::types::ArchEntry;

/// Inputs for one scan pass over a capture tree.
#[derive(Clone)]
pub struct ScanOptions {
    pub root: PathBuf,
    pub discriminator: String,
    pub debug: bool,
}

// ---------------------------------------------------------------------------
// Record stream opening
// ---------------------------------------------------------------------------

/// Open an archive file as a framed record stream. Files ending in `.bz2`
/// are wrapped in a bzip2 decoder; the framing on top is identical.
pub fn open_records(path: &Path) -> Result<RecordReader<Box<dyn Read + Send>>, ArchiveError> {
    let file = File::open(path)?;
    let stream: Box<dyn Read + Send> =
        if path.extension().and_then(|e| e.to_str()) == Some("bz2") {
            Box::new(bzip2::read::BzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
    Ok(RecordReader::new(stream))
}

// ---------------------------------------------------------------------------
// Year-month directories
// ---------------------------------------------------------------------------

/// Parse a directory basename of the form `YYYY.MM` (months 01-12).
fn year_month(name: &str) -> Option<(i32, u32)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^(\d{4})\.(0[1-9]|1[0-2])$").expect("static regex"));
    let caps = re.captures(name)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// Walk the tree and build a sorted staging catalog.
///
/// `last` is the incremental-rescan watermark: when present, year-month
/// directories older than its month are skipped, and only files whose
/// first-record timestamp is strictly newer are admitted. A full scan passes
/// `None`.
pub fn scan_archive(opts: &ScanOptions, last: Option<DateTime<Utc>>) -> TimeEntrySlice {
    let candidates = collect_candidates(opts, last);

    let debug_scan = opts.debug;
    let mut entries: Vec<ArchEntry> = candidates
        .par_iter()
        .filter_map(|path| match first_record_date(path) {
            Ok((sdate, size)) => Some(ArchEntry::new(path.clone(), sdate, size)),
            Err(e) => {
                if debug_scan {
                    debug!(file = %path.display(), error = %e, "first record unreadable, skipping");
                }
                None
            }
        })
        .collect();

    if let Some(last) = last {
        entries.retain(|e| e.sdate > last);
    }

    TimeEntrySlice::from_entries(entries)
}

/// Collect admitted file paths: depth-first walk with year-month pruning and
/// the discriminator filter. Non-year-month directories are always descended.
fn collect_candidates(opts: &ScanOptions, last: Option<DateTime<Utc>>) -> Vec<PathBuf> {
    let last_ym = last.map(|t| (t.year(), t.month()));
    let walker = WalkBuilder::new(&opts.root)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .filter_entry(move |entry| {
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                if let (Some((y, m)), Some((ly, lm))) =
                    (year_month(&entry.file_name().to_string_lossy()), last_ym)
                {
                    return (y, m) >= (ly, lm);
                }
            }
            true
        })
        .build();

    let mut out = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "walk error");
                continue;
            }
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.into_path();
        if path.to_string_lossy().contains(&opts.discriminator) {
            out.push(path);
        }
    }
    out
}

/// Read and decode a file's first framed record, returning its embedded
/// timestamp and the file's on-disk size.
fn first_record_date(path: &Path) -> Result<(DateTime<Utc>, u64), ArchiveError> {
    let size = std::fs::metadata(path)?.len();
    let mut records = open_records(path)?;
    let raw = records
        .next_record()?
        .ok_or_else(|| ArchiveError::Decode("file holds no records".into()))?;
    let header = CommonHeader::parse(raw)?;
    Ok((header.time(), size))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
