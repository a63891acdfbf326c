//! Report output for the CLI: stdout, or the file named by `--output`

use ephys_stream::StreamResult;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Serialize a report as JSON, indented unless `compact`, and emit it.
pub fn emit_json<T: Serialize>(
    report: &T,
    compact: bool,
    path: Option<&Path>,
) -> StreamResult<()> {
    match path {
        Some(path) => {
            let mut file = BufWriter::new(File::create(path)?);
            write_json(&mut file, report, compact)?;
            file.flush()?;
        }
        None => write_json(&mut std::io::stdout().lock(), report, compact)?,
    }
    Ok(())
}

fn write_json<W: Write, T: Serialize>(
    out: &mut W,
    report: &T,
    compact: bool,
) -> StreamResult<()> {
    if compact {
        serde_json::to_writer(&mut *out, report)?;
    } else {
        serde_json::to_writer_pretty(&mut *out, report)?;
    }
    writeln!(out)?;
    Ok(())
}

/// Emit a rendered text report.
pub fn emit_text(text: &str, path: Option<&Path>) -> StreamResult<()> {
    match path {
        Some(path) => std::fs::write(path, format!("{}\n", text))?,
        None => writeln!(std::io::stdout().lock(), "{}", text)?,
    }
    Ok(())
}

/// Session file size for listings
pub fn format_size(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    match bytes {
        0..=1023 => format!("{} B", bytes),
        1024..=1_048_575 => format!("{:.1} KB", bytes as f64 / KB),
        _ => format!("{:.1} MB", bytes as f64 / KB / KB),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn test_emit_json_to_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("report.json");
        emit_json(&serde_json::json!({"peaks": 3}), true, Some(&path)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"peaks\":3}\n");
    }
}
