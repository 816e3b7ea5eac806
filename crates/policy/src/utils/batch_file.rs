use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name for the `seq`-th batch written at `now`.
pub fn batch_file_name(now: DateTime<Utc>, seq: u64) -> String {
    format!("{}-{:06}.jsonl", now.format("%Y%m%dT%H%M%S%3f"), seq)
}

/// Writes `lines` as one JSONL batch into `dir`, creating the directory if needed.
/// An existing file with the same name is truncated.
pub fn write_batch(dir: &Path, file_name: &str, lines: &[String]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name);
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    file.flush()?;
    Ok(path)
}
