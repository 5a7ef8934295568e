//! Streaming Intel-HEX parser.
//!
//! Bytes arrive incrementally; a complete line is decoded as soon as a
//! terminator (CR or LF) is seen, so a caller can feed a socket's worth of
//! data at a time without buffering a whole image. Reuses [`ihex::Record`]
//! as the decoded record type — the same shape any other Intel-HEX
//! consumer in the ecosystem would produce — but this module owns its own
//! line accumulation, checksum validation and address-base tracking
//! rather than going through a whole-buffer reader.

use crate::error::HexError;
pub use ihex::Record;

/// Minimum line-accumulator capacity: a maximal 255-byte DATA record's
/// `:CCAAAATTDD...DDSS` text is 521 bytes; round up with slack for CR/LF.
pub const MIN_LINE_CAPACITY: usize = 600;

/// Invoked with `(record, absolute_address)` for every line that decodes
/// successfully. `absolute_address` is the address a [`Record::Data`]'s
/// bytes land at; for every other variant it mirrors the parser's current
/// base, for observability only.
pub type Callback<'a> = dyn FnMut(Record, u32) + 'a;

/// Streaming decoder state: the two address-base registers, the line
/// accumulator, and the running counters from spec.md's session-status
/// surface.
#[derive(Debug, Default)]
pub struct Parser {
    extended_linear: u32,
    extended_segment: u32,
    accumulator: Vec<u8>,
    capacity: usize,
    skipping: bool,
    eof_seen: bool,
    lines: u64,
    data_bytes: u64,
    errors: u64,
}

impl Parser {
    /// A parser with the minimum line-accumulator capacity.
    pub fn new() -> Self {
        Parser::with_capacity(MIN_LINE_CAPACITY)
    }

    /// A parser whose line accumulator holds at least `capacity` bytes
    /// (clamped up to [`MIN_LINE_CAPACITY`]).
    pub fn with_capacity(capacity: usize) -> Self {
        Parser {
            capacity: capacity.max(MIN_LINE_CAPACITY),
            ..Default::default()
        }
    }

    /// Number of lines that reached a terminator and were decoded
    /// (successfully or not).
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Total bytes carried by every `Data` record seen so far.
    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    /// Count of malformed lines, checksum failures, and accumulator
    /// overflows observed so far.
    pub fn errors(&self) -> u64 {
        self.errors
    }

    /// Clears both address bases, the line accumulator, and every
    /// counter, so the same [`Parser`] can be reused for a new image.
    pub fn reset(&mut self) {
        *self = Parser::with_capacity(self.capacity);
    }

    /// Appends `bytes` to the accumulator, decoding and invoking
    /// `on_record` for each complete line. Bytes received after an `EOF`
    /// record has been decoded are ignored.
    pub fn feed(&mut self, bytes: &[u8], on_record: &mut Callback<'_>) {
        for &byte in bytes {
            if self.eof_seen {
                continue;
            }
            match byte {
                b'\r' | b'\n' => {
                    if self.skipping {
                        self.skipping = false;
                        self.accumulator.clear();
                        continue;
                    }
                    if !self.accumulator.is_empty() {
                        self.decode_line(on_record);
                        self.accumulator.clear();
                    }
                }
                _ => {
                    if self.skipping {
                        continue;
                    }
                    self.accumulator.push(byte);
                    if self.accumulator.len() > self.capacity {
                        tracing::warn!(
                            capacity = self.capacity,
                            "hex line accumulator overflowed, dropping line"
                        );
                        self.errors += 1;
                        self.accumulator.clear();
                        self.skipping = true;
                    }
                }
            }
        }
    }

    fn decode_line(&mut self, on_record: &mut Callback<'_>) {
        self.lines += 1;
        let line = match std::str::from_utf8(&self.accumulator) {
            Ok(s) => s.trim().to_string(),
            Err(_) => {
                self.errors += 1;
                return;
            }
        };
        match self.decode(&line) {
            Ok((record, absolute)) => {
                if let Record::Data { value, .. } = &record {
                    self.data_bytes += value.len() as u64;
                }
                if matches!(record, Record::EndOfFile) {
                    self.eof_seen = true;
                }
                on_record(record, absolute);
            }
            Err(_) => self.errors += 1,
        }
    }

    fn decode(&mut self, line: &str) -> Result<(Record, u32), HexError> {
        let line = line.strip_prefix(':').ok_or(HexError::BadFormat)?;
        let raw = decode_hex(line)?;
        if raw.len() < 5 {
            return Err(HexError::BadFormat);
        }
        let byte_count = raw[0] as usize;
        if raw.len() != byte_count + 5 {
            return Err(HexError::BadFormat);
        }
        let sum: u32 = raw.iter().map(|&b| b as u32).sum();
        if sum % 256 != 0 {
            return Err(HexError::BadChecksum);
        }

        let local_addr = u16::from_be_bytes([raw[1], raw[2]]);
        let record_type = raw[3];
        let data = &raw[4..4 + byte_count];

        let record = match record_type {
            0x00 => Record::Data {
                offset: local_addr,
                value: data.to_vec(),
            },
            0x01 => Record::EndOfFile,
            0x02 if data.len() == 2 => Record::ExtendedSegmentAddress(u16::from_be_bytes([data[0], data[1]])),
            0x03 if data.len() == 4 => Record::StartSegmentAddress {
                cs: u16::from_be_bytes([data[0], data[1]]),
                ip: u16::from_be_bytes([data[2], data[3]]),
            },
            0x04 if data.len() == 2 => Record::ExtendedLinearAddress(u16::from_be_bytes([data[0], data[1]])),
            0x05 if data.len() == 4 => Record::StartLinearAddress(u32::from_be_bytes([data[0], data[1], data[2], data[3]])),
            _ => return Err(HexError::BadFormat),
        };

        match &record {
            Record::ExtendedLinearAddress(hi) => self.extended_linear = u32::from(*hi) << 16,
            Record::ExtendedSegmentAddress(seg) => self.extended_segment = u32::from(*seg) << 4,
            _ => {}
        }

        let absolute = match &record {
            Record::Data { .. } => self
                .extended_linear
                .wrapping_add(self.extended_segment)
                .wrapping_add(u32::from(local_addr)),
            _ => self.extended_linear.wrapping_add(self.extended_segment),
        };

        Ok((record, absolute))
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, HexError> {
    if s.len() % 2 != 0 {
        return Err(HexError::BadFormat);
    }
    let chars = s.as_bytes();
    let mut out = Vec::with_capacity(chars.len() / 2);
    for pair in chars.chunks_exact(2) {
        out.push((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?);
    }
    Ok(out)
}

fn hex_digit(c: u8) -> Result<u8, HexError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(HexError::BadFormat),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn collect(input: &[u8]) -> Vec<(Record, u32)> {
        let mut parser = Parser::new();
        let mut out = Vec::new();
        parser.feed(input, &mut |record, addr| out.push((record, addr)));
        out
    }

    #[test]
    fn minimal_ingestion() {
        let input = b":10010000214601360121470136007EFE09D2190140\n:00000001FF\n";
        let records = collect(input);
        assert_eq!(records.len(), 2);
        match &records[0] {
            (Record::Data { value, .. }, addr) => {
                assert_eq!(*addr, 0x0000_0100);
                assert_eq!(
                    value.as_slice(),
                    &[0x21, 0x46, 0x01, 0x36, 0x01, 0x21, 0x47, 0x01, 0x36, 0x00, 0x7E, 0xFE, 0x09, 0xD2, 0x19, 0x01]
                );
            }
            other => panic!("expected Data record, got {other:?}"),
        }
        assert!(matches!(records[1].0, Record::EndOfFile));
    }

    #[test]
    fn base_switching() {
        let input = b":02000004F000FA\n:04000000DEADBEEF24\n:00000001FF\n";
        let records = collect(input);
        assert_eq!(records.len(), 3);
        match &records[1] {
            (Record::Data { value, .. }, addr) => {
                assert_eq!(*addr, 0xF000_0000);
                assert_eq!(value.as_slice(), &[0xDE, 0xAD, 0xBE, 0xEF]);
            }
            other => panic!("expected Data record, got {other:?}"),
        }
    }

    #[test]
    fn checksum_rejection_increments_error_counter_only() {
        let input = b":10010000214601360121470136007EFE09D2190141\n";
        let mut parser = Parser::new();
        let mut count = 0;
        parser.feed(input, &mut |_, _| count += 1);
        assert_eq!(count, 0);
        assert_eq!(parser.errors(), 1);
    }

    #[test]
    fn reset_clears_bases_and_counters() {
        let mut parser = Parser::new();
        parser.feed(b":02000004F000FA\n", &mut |_, _| {});
        assert_eq!(parser.lines(), 1);
        parser.reset();
        assert_eq!(parser.lines(), 0);
        let records = collect(b":04000000DEADBEEF24\n");
        assert_eq!(records[0].1, 0x0000_0000);
    }
}
