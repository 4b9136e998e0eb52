//! Trace-file parsing and timestamp formatting.
//!
//! A trace file drives deterministic emulation: the first line is the packet
//! count, each following line holds `inter-arrival-ms tokens service-ms` for
//! one packet. Lines are limited to 1024 characters and must not carry
//! leading or trailing whitespace.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Per-packet record from a trace file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub inter_arrival_ms: u64,
    pub tokens: u64,
    pub service_ms: u64,
}

#[derive(Debug)]
pub struct TraceError {
    pub line: usize,
    pub reason: String,
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "malformed input, line {}: {}", self.line, self.reason)
    }
}

impl std::error::Error for TraceError {}

fn bad(line: usize, reason: &str) -> TraceError {
    TraceError { line, reason: reason.to_string() }
}

fn check_line(line: &str, lineno: usize) -> Result<(), TraceError> {
    if line.len() > 1024 {
        return Err(bad(lineno, "longer than 1024 characters"));
    }
    if line.starts_with(' ')
        || line.starts_with('\t')
        || line.ends_with(' ')
        || line.ends_with('\t')
    {
        return Err(bad(lineno, "leading or trailing whitespace"));
    }
    Ok(())
}

fn parse_field(field: &str, lineno: usize) -> Result<u64, TraceError> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad(lineno, "field is not an unsigned integer"));
    }
    let v: u64 = field.parse().map_err(|_| bad(lineno, "field out of range"))?;
    if v == 0 {
        return Err(bad(lineno, "field is not positive"));
    }
    Ok(v)
}

/// Parse a whole trace file: the packet count plus one record per packet.
pub fn parse_trace(path: &Path) -> Result<Vec<TraceRecord>, Box<dyn std::error::Error>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = reader.lines();

    let first = lines.next().ok_or_else(|| bad(1, "empty trace file"))??;
    check_line(&first, 1)?;
    let count = parse_field(first.trim_end_matches('\n'), 1)? as usize;

    let mut records = Vec::with_capacity(count);
    for (idx, line) in lines.enumerate() {
        let lineno = idx + 2;
        if records.len() == count {
            break;
        }
        let line = line?;
        check_line(&line, lineno)?;
        let mut fields = line.split_whitespace();
        let inter = parse_field(fields.next().ok_or_else(|| bad(lineno, "missing field"))?, lineno)?;
        let tokens = parse_field(fields.next().ok_or_else(|| bad(lineno, "missing field"))?, lineno)?;
        let service =
            parse_field(fields.next().ok_or_else(|| bad(lineno, "missing field"))?, lineno)?;
        records.push(TraceRecord {
            inter_arrival_ms: inter,
            tokens,
            service_ms: service,
        });
    }
    if records.len() < count {
        return Err(Box::new(bad(records.len() + 1, "fewer records than the declared count")));
    }
    Ok(records)
}

/// Emulation timestamps: microseconds rendered as zero-padded milliseconds,
/// `00000012.345`. Values too wide for the field render as question marks.
pub fn timestamp(us: u64) -> String {
    let ms = us as f64 / 1000.0;
    if ms >= 1e8 {
        return String::from("????????.???");
    }
    format!("{:012.3}", ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(content: &str) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("shaper-trace-{}-{:?}", std::process::id(), std::thread::current().id()));
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn parses_a_wellformed_trace() {
        let path = write_temp("2\n100 3 50\n200 1 75\n");
        let records = parse_trace(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            records,
            [
                TraceRecord { inter_arrival_ms: 100, tokens: 3, service_ms: 50 },
                TraceRecord { inter_arrival_ms: 200, tokens: 1, service_ms: 75 },
            ]
        );
    }

    #[test]
    fn rejects_nonnumeric_fields() {
        let path = write_temp("1\n100 x 50\n");
        assert!(parse_trace(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn rejects_leading_whitespace() {
        let path = write_temp("1\n 100 3 50\n");
        assert!(parse_trace(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn rejects_truncated_traces() {
        let path = write_temp("3\n100 3 50\n");
        assert!(parse_trace(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn timestamps_are_fixed_width_ms() {
        assert_eq!(timestamp(0), "00000000.000");
        assert_eq!(timestamp(12_345_678), "00012345.678");
        assert_eq!(timestamp(100_000_000_000_000), "????????.???");
    }
}
