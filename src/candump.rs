//! Reader for `candump -L` log files, used to replay recorded traffic.
//!
//! Each line looks like `(1697040000.123456) can0 356#64140A009600`.

use crate::transport::CanFrame;
use crate::Error;
use std::io::BufRead;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Time since the epoch as written by candump.
    pub timestamp: Duration,
    pub interface: String,
    pub frame: CanFrame,
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(text.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Parses a hex string such as `64140A00` into bytes. Spaces are ignored.
pub fn parse_payload(text: &str) -> Result<Vec<u8>, Error> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    parse_hex(&compact).ok_or_else(|| Error::Candump {
        line: 0,
        reason: format!("invalid hex payload '{text}'"),
    })
}

fn parse_timestamp(text: &str) -> Option<Duration> {
    let inner = text.strip_prefix('(')?.strip_suffix(')')?;
    let (secs, frac) = inner.split_once('.').unwrap_or((inner, "0"));
    let secs = secs.parse::<u64>().ok()?;
    let digits = frac.len().min(9);
    let mut nanos = frac.get(..digits)?.parse::<u32>().ok()?;
    for _ in digits..9 {
        nanos *= 10;
    }
    Some(Duration::new(secs, nanos))
}

/// Parses one log line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str, number: usize) -> Result<Option<Record>, Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let fail = |reason: String| Error::Candump {
        line: number,
        reason,
    };

    let mut parts = line.split_whitespace();
    let (Some(timestamp), Some(interface), Some(frame), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(fail(format!("expected '(time) interface id#data', got '{line}'")));
    };
    let timestamp =
        parse_timestamp(timestamp).ok_or_else(|| fail(format!("invalid timestamp '{timestamp}'")))?;
    let (id, data) = frame
        .split_once('#')
        .ok_or_else(|| fail(format!("missing '#' in '{frame}'")))?;
    if data.starts_with('#') || data.starts_with('R') {
        return Err(fail(format!("unsupported frame type '{frame}'")));
    }
    let id = u32::from_str_radix(id, 16).map_err(|_| fail(format!("invalid id '{id}'")))?;
    let data = parse_hex(data).ok_or_else(|| fail(format!("invalid payload '{data}'")))?;
    let frame = CanFrame::new(id, &data).map_err(|err| fail(err.to_string()))?;

    Ok(Some(Record {
        timestamp,
        interface: interface.to_string(),
        frame,
    }))
}

/// Reads every record from `reader`, stopping at the first malformed line.
pub fn read(reader: impl BufRead) -> Result<Vec<Record>, Error> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        if let Some(record) = parse_line(&line?, index + 1)? {
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_line() {
        let record = parse_line("(1697040000.123456) can0 356#64140A009600", 1)
            .unwrap()
            .unwrap();
        assert_eq!(record.timestamp, Duration::new(1697040000, 123_456_000));
        assert_eq!(record.interface, "can0");
        assert_eq!(record.frame.id, 0x356);
        assert_eq!(record.frame.data, vec![0x64, 0x14, 0x0A, 0x00, 0x96, 0x00]);
    }

    #[test]
    fn empty_payload_and_comments() {
        let record = parse_line("(1.5) vcan1 35C#", 1).unwrap().unwrap();
        assert_eq!(record.timestamp, Duration::from_millis(1500));
        assert!(record.frame.data.is_empty());
        assert_eq!(parse_line("", 2).unwrap(), None);
        assert_eq!(parse_line("  # recorded in the shed", 3).unwrap(), None);
    }

    #[test]
    fn malformed_lines_name_the_line() {
        for line in [
            "can0 356#00",
            "(1.0) can0 356",
            "(1.0) can0 XYZ#00",
            "(1.0) can0 356#0",
            "(1.0) can0 356#R",
            "(1.0) can0 800#00",
            "(1.0) can0 356#000000000000000000",
            "(x) can0 356#00",
        ] {
            assert!(
                matches!(parse_line(line, 7), Err(Error::Candump { line: 7, .. })),
                "{line}"
            );
        }
    }

    #[test]
    fn reads_whole_log() {
        let log = "(1.0) can0 356#6414\n\n(2.0) can1 355#32006300\n";
        let records = read(log.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].interface, "can1");
        assert_eq!(records[1].frame.id, 0x355);

        let broken = "(1.0) can0 356#6414\nnonsense\n";
        assert!(matches!(
            read(broken.as_bytes()),
            Err(Error::Candump { line: 2, .. })
        ));
    }

    #[test]
    fn payload_hex() {
        assert_eq!(parse_payload("64 14 0a").unwrap(), vec![0x64, 0x14, 0x0A]);
        assert!(parse_payload("6").is_err());
        assert!(parse_payload("zz").is_err());
    }
}
