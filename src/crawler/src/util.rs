use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// An object creation time later than the evaluation time.
#[derive(Debug, Clone, thiserror::Error)]
#[error("object date {created} can't be in the future (now {now})")]
pub struct InvalidTimestamp {
    pub created: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// Whole days elapsed between `created` and `now`, `floor(hours / 24)`.
pub fn age_in_days(created: DateTime<Utc>, now: DateTime<Utc>) -> Result<i64, InvalidTimestamp> {
    let hours = (now - created).num_milliseconds() as f64 / 3_600_000.0;
    let age = (hours / 24.0).floor() as i64;
    if age < 0 {
        return Err(InvalidTimestamp { created, now });
    }
    Ok(age)
}

/// Human readable SI size (`1.0 MB`).
pub fn byte_count_si(bytes: u64) -> String {
    const UNIT: u64 = 1000;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = b"kMGTPE"[exp] as char;
    format!("{:.1} {}B", bytes as f64 / div as f64, suffix)
}

/// Gzip a batch of bytes.
pub fn compress_bytes(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inverse of [`compress_bytes`], used to read persisted run log batches.
pub fn decompress_bytes(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_age_in_days() {
        let now = Utc::now();
        assert_eq!(age_in_days(now, now).unwrap(), 0);
        assert_eq!(age_in_days(now - Duration::hours(24), now).unwrap(), 1);
        assert_eq!(age_in_days(now - Duration::hours(23), now).unwrap(), 0);
        assert_eq!(age_in_days(now - Duration::days(23), now).unwrap(), 23);
    }

    #[test]
    fn test_age_in_days_rejects_future() {
        let now = Utc::now();
        let err = age_in_days(now + Duration::minutes(1), now).unwrap_err();
        assert!(err.to_string().contains("can't be in the future"));
    }

    #[test]
    fn test_byte_count_si() {
        assert_eq!(byte_count_si(1), "1 B");
        assert_eq!(byte_count_si(32), "32 B");
        assert_eq!(byte_count_si(1_048_576), "1.0 MB");
        assert_eq!(byte_count_si(1_073_741_824), "1.1 GB");
    }

    #[test]
    fn test_compress_round_trip_keeps_lines() {
        let lines: Vec<String> = (0..50)
            .map(|i| format!("{{\"record\":{i},\"name\":\"object-{i}\"}}"))
            .collect();
        let mut batch = lines.join("\n");
        batch.push('\n');

        let compressed = compress_bytes(batch.as_bytes()).unwrap();
        // gzip magic
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);

        let restored = decompress_bytes(&compressed).unwrap();
        let restored = String::from_utf8(restored).unwrap();
        let restored_lines: Vec<&str> = restored.lines().collect();
        assert_eq!(restored_lines.len(), 50);
        assert_eq!(restored_lines, lines.iter().map(String::as_str).collect::<Vec<_>>());
    }
}
