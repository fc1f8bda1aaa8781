//! Journal inspection commands

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use lumatm_common::config::{Config, JournalKind};
use lumatm_common::types::Timestamp;
use lumatm_journal::{inspect_dangling_records, read_records, LogHeader, TransactionLogRecord};

fn format_time(millis: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map_or_else(|| millis.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
}

fn write_header(out: &mut impl Write, path: &Path, header: &LogHeader) -> Result<()> {
    writeln!(
        out,
        "{}: format {:#010x}, generation {}, {:?}, {} bytes used",
        path.display(),
        header.format_id,
        format_time(header.timestamp),
        header.state,
        header.position
    )?;
    Ok(())
}

fn write_record(out: &mut impl Write, record: &TransactionLogRecord) -> Result<()> {
    let names: Vec<&str> = record.unique_names().iter().map(String::as_str).collect();
    writeln!(
        out,
        "  #{:<6} {} {:<14} {} [{}]",
        record.sequence(),
        format_time(record.time()),
        record.status(),
        record.gtrid(),
        names.join(", ")
    )?;
    Ok(())
}

/// Print the header and records of one journal file
pub fn dump(out: &mut impl Write, path: &Path, skip_corrupted: bool) -> Result<()> {
    let (header, records) = read_records(path, skip_corrupted)
        .with_context(|| format!("cannot read journal file {}", path.display()))?;
    write_header(out, path, &header)?;
    for record in &records {
        write_record(out, record)?;
    }
    writeln!(out, "  {} record(s)", records.len())?;
    Ok(())
}

/// Print the records recovery would still commit
pub fn dangling(out: &mut impl Write, config: &Config) -> Result<()> {
    if config.journal == JournalKind::Null {
        anyhow::bail!("the configured journal is disabled, nothing to inspect");
    }
    let dangling = inspect_dangling_records(
        &config.log_part1_filename,
        &config.log_part2_filename,
        config.skip_corrupted_logs,
    )
    .context("cannot read the configured journal")?;

    let mut records: Vec<_> = dangling.into_values().collect();
    records.sort_by_key(TransactionLogRecord::sequence);
    for record in &records {
        write_record(out, record)?;
    }
    writeln!(out, "{} dangling transaction(s)", records.len())?;
    Ok(())
}
