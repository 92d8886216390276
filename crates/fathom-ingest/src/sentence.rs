//! NMEA-0183 sentence handling: checksum validation, fix-time extraction,
//! and the byte-fed framer that groups sentences into blocks.

/// Largest block shipped in one piece.
pub const MAX_MSG_SIZE: usize = 4000;

/// Cap on a single sentence while it is being assembled.
pub const MAX_SENTENCE: usize = MAX_MSG_SIZE / 4;

/// Validate the XOR checksum of one sentence: `$...*HH` without the CRLF.
///
/// The checksum covers every byte between '$' and '*'; the trailer is two
/// hex digits. Anything structurally off fails the check.
pub fn checksum_ok(sentence: &[u8]) -> bool {
    if sentence.len() < 4 || sentence[0] != b'$' {
        return false;
    }
    let star = sentence.len() - 3;
    if sentence[star] != b'*' {
        return false;
    }

    let mut crc = 0u8;
    for &byte in &sentence[1..star] {
        crc ^= byte;
    }

    match std::str::from_utf8(&sentence[star + 1..]) {
        Ok(hex) => u8::from_str_radix(hex, 16).map_or(false, |trailer| trailer == crc),
        Err(_) => false,
    }
}

/// Extract the fix time (milliseconds of day) from a sentence.
///
/// Recognized types: GGA, RMC, GLL, BWC, ZDA. GLL carries its time after the
/// fifth comma; the others at a fixed offset of 7 bytes. Returns `None` for
/// every other type and for unparseable time fields.
pub fn sentence_time_ms(sentence: &[u8]) -> Option<i64> {
    let kind = sentence.get(3..6)?;
    if !matches!(kind, b"GGA" | b"RMC" | b"GLL" | b"BWC" | b"ZDA") {
        return None;
    }

    let start = if kind == b"GLL" {
        let mut commas = 0;
        let mut start = None;
        for (i, &byte) in sentence.iter().enumerate().skip(5) {
            if byte == b',' {
                commas += 1;
                if commas == 5 {
                    start = Some(i + 1);
                    break;
                }
            }
        }
        start?
    } else {
        7
    };

    parse_hhmmss(sentence.get(start..)?)
}

/// Parse `HHMMSS[.mmm]` into milliseconds of day.
fn parse_hhmmss(field: &[u8]) -> Option<i64> {
    let two = |at: usize| -> Option<i64> {
        let a = field.get(at)?;
        let b = field.get(at + 1)?;
        if !a.is_ascii_digit() || !b.is_ascii_digit() {
            return None;
        }
        Some(((a - b'0') as i64) * 10 + (b - b'0') as i64)
    };

    let hour = two(0)?;
    let minute = two(2)?;
    let second = two(4)?;
    let mut ms = 1000 * (3600 * hour + 60 * minute + second);

    if field.get(6) == Some(&b'.') {
        let digits: i64 = field[7..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .fold(0, |acc, b| acc * 10 + (b - b'0') as i64);
        ms += digits;
    }
    Some(ms)
}

/// Validate a datagram holding one or more sentences: scan for '*'
/// separators and accept the whole block if any embedded sentence passes
/// its checksum.
pub fn block_has_valid_sentence(block: &[u8]) -> bool {
    let mut offset = 0usize;
    while offset < block.len() {
        let Some(star) = block[offset..].iter().position(|&b| b == b'*') else {
            break;
        };

        let mut crc = 0u8;
        for &byte in &block[offset + 1..offset + star] {
            crc ^= byte;
        }

        let trailer = block.get(offset + star + 1..offset + star + 3);
        let ok = trailer
            .and_then(|hex| std::str::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            .map_or(false, |t| t == crc);
        if ok {
            return true;
        }

        // Past "*HH\r\n" to the start of the next sentence.
        offset += star + 5;
    }
    false
}

// ── Block framer ──────────────────────────────────────────────────────────────

/// A completed block: receive time of its first byte plus the sentence data.
#[derive(Debug, PartialEq, Eq)]
pub struct FramedBlock {
    pub time: i64,
    pub data: Vec<u8>,
}

/// Result of feeding one byte into the framer.
#[derive(Debug, Default)]
pub struct FramerOutput {
    pub block: Option<FramedBlock>,
    /// A sentence finished and passed the skip filter; auto-baud search
    /// treats this as proof the current rate is right.
    pub accepted: bool,
}

/// Byte-fed sentence assembler and time-based block grouper.
///
/// Sentences start at '$' and end at CR; anything else outside a sentence is
/// discarded. Finished sentences accumulate, CRLF-separated, into one block
/// until the extracted fix time changes or the block would overflow. A
/// sentence arriving before any fix time is known ships alone.
pub struct NmeaFramer {
    skip_broken: bool,
    sentence: Vec<u8>,
    block: Vec<u8>,
    /// Receive time of the earliest unshipped byte, 0 when unset.
    block_time: i64,
    /// Current group's fix time in ms of day, 0 while unknown.
    group_time: i64,
}

impl NmeaFramer {
    pub fn new(skip_broken: bool) -> Self {
        Self {
            skip_broken,
            sentence: Vec::with_capacity(MAX_SENTENCE),
            block: Vec::with_capacity(MAX_MSG_SIZE),
            block_time: 0,
            group_time: 0,
        }
    }

    pub fn set_skip_broken(&mut self, skip_broken: bool) {
        self.skip_broken = skip_broken;
    }

    /// Feed one received byte; `now` is its receive time in monotonic µs.
    pub fn push_byte(&mut self, byte: u8, now: i64) -> FramerOutput {
        if self.block_time == 0 {
            self.block_time = now;
        }

        if self.sentence.is_empty() && byte != b'$' {
            return FramerOutput::default();
        }

        if byte != b'\r' {
            if self.sentence.len() > MAX_SENTENCE - 2 {
                self.sentence.clear();
                return FramerOutput::default();
            }
            self.sentence.push(byte);
            return FramerOutput::default();
        }

        // CR: the sentence is complete.
        if self.sentence.len() < 10 {
            self.sentence.clear();
            return FramerOutput::default();
        }

        let bad_crc = !checksum_ok(&self.sentence);
        if self.skip_broken && bad_crc {
            self.sentence.clear();
            return FramerOutput::default();
        }

        let mut send_block = false;

        // Only intact sentences may steer the grouping time.
        if !bad_crc {
            if let Some(time) = sentence_time_ms(&self.sentence) {
                if self.group_time > 0 && self.group_time != time {
                    send_block = true;
                }
                self.group_time = time;
            }
        }

        if self.block.len() + self.sentence.len() + 3 > MAX_MSG_SIZE {
            send_block = true;
        }

        // Without a known fix time the sentence travels alone.
        if self.group_time == 0 {
            let mut data = std::mem::take(&mut self.sentence);
            data.extend_from_slice(b"\r\n");
            let block = FramedBlock { time: self.block_time, data };
            self.block_time = 0;
            return FramerOutput { block: Some(block), accepted: true };
        }

        let emitted = if send_block && !self.block.is_empty() {
            let block = FramedBlock {
                time: self.block_time,
                data: std::mem::replace(&mut self.block, Vec::with_capacity(MAX_MSG_SIZE)),
            };
            self.block_time = 0;
            Some(block)
        } else {
            None
        };

        self.block.extend_from_slice(&self.sentence);
        self.block.extend_from_slice(b"\r\n");
        self.sentence.clear();

        FramerOutput { block: emitted, accepted: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Append the correct checksum trailer to a bare sentence body.
    fn with_crc(body: &str) -> String {
        let crc = body.bytes().skip(1).fold(0u8, |acc, b| acc ^ b);
        format!("{body}*{crc:02X}")
    }

    fn feed(framer: &mut NmeaFramer, sentence: &str, now: i64) -> Vec<FramedBlock> {
        let mut blocks = Vec::new();
        for byte in sentence.bytes().chain(*b"\r\n") {
            if let Some(block) = framer.push_byte(byte, now).block {
                blocks.push(block);
            }
        }
        blocks
    }

    #[test]
    fn checksum_accepts_valid_and_rejects_corrupt() {
        let good = with_crc("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,");
        assert!(checksum_ok(good.as_bytes()));

        let mut bad = good.into_bytes();
        bad[10] ^= 0x01;
        assert!(!checksum_ok(&bad));

        assert!(!checksum_ok(b"$GP"));
        assert!(!checksum_ok(b"GPGGA,123519*00"));
    }

    #[test]
    fn time_extraction_per_sentence_type() {
        // 12:35:19 = 45319 s of day.
        let expected = 45_319 * 1000;
        assert_eq!(sentence_time_ms(b"$GPGGA,123519,4807.038,N"), Some(expected));
        assert_eq!(sentence_time_ms(b"$GPRMC,123519,A,4807.038,N"), Some(expected));
        assert_eq!(sentence_time_ms(b"$GPZDA,123519.250,04,07,2002"), Some(expected + 250));
        // GLL: time after the fifth comma.
        assert_eq!(
            sentence_time_ms(b"$GPGLL,4916.45,N,12311.12,W,123519,A"),
            Some(expected)
        );
        // Unknown type carries no extractable time.
        assert_eq!(sentence_time_ms(b"$GPDBT,011.0,f,003.3,M,001.8,F"), None);
        // Garbage in the time field.
        assert_eq!(sentence_time_ms(b"$GPGGA,12x519,4807.038,N"), None);
    }

    #[test]
    fn two_fix_times_make_exactly_two_blocks() {
        let mut framer = NmeaFramer::new(false);
        let mut blocks = Vec::new();

        let first = [
            with_crc("$GPGGA,123519.000,4807.038,N,01131.000,E,1,08,0.9,545.4,M,,,,"),
            with_crc("$GPGGA,123519.000,4807.039,N,01131.001,E,1,08,0.9,545.5,M,,,,"),
        ];
        let second = [
            with_crc("$GPGGA,123520.000,4807.040,N,01131.002,E,1,08,0.9,545.6,M,,,,"),
            with_crc("$GPGGA,123520.000,4807.041,N,01131.003,E,1,08,0.9,545.7,M,,,,"),
        ];

        for s in &first {
            blocks.extend(feed(&mut framer, s, 1_000));
        }
        for s in &second {
            blocks.extend(feed(&mut framer, s, 2_000));
        }
        // Flush the second group by moving time forward once more.
        blocks.extend(feed(
            &mut framer,
            &with_crc("$GPGGA,123521.000,4807.042,N,01131.004,E,1,08,0.9,545.8,M,,,,"),
            3_000,
        ));

        assert_eq!(blocks.len(), 2);
        let first_block = String::from_utf8(blocks[0].data.clone()).unwrap();
        assert_eq!(first_block.matches("123519.000").count(), 2);
        assert!(!first_block.contains("123520"));
        let second_block = String::from_utf8(blocks[1].data.clone()).unwrap();
        assert_eq!(second_block.matches("123520.000").count(), 2);
    }

    #[test]
    fn timeless_sentence_ships_alone_before_any_fix() {
        let mut framer = NmeaFramer::new(false);
        let sentence = with_crc("$GPDBT,011.0,f,003.3,M,001.8,F");
        let blocks = feed(&mut framer, &sentence, 500);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].time, 500);
        assert_eq!(blocks[0].data, format!("{sentence}\r\n").into_bytes());
    }

    #[test]
    fn timeless_sentence_joins_an_open_group() {
        let mut framer = NmeaFramer::new(false);
        let gga = with_crc("$GPGGA,123519.000,4807.038,N,01131.000,E,1,08,0.9,545.4,M,,,,");
        let dbt = with_crc("$GPDBT,011.0,f,003.3,M,001.8,F");

        assert!(feed(&mut framer, &gga, 100).is_empty());
        assert!(feed(&mut framer, &dbt, 150).is_empty());

        // The next fix time flushes both sentences as one block.
        let next = with_crc("$GPGGA,123520.000,4807.038,N,01131.000,E,1,08,0.9,545.4,M,,,,");
        let blocks = feed(&mut framer, &next, 200);
        assert_eq!(blocks.len(), 1);
        let text = String::from_utf8(blocks[0].data.clone()).unwrap();
        assert!(text.contains("GPGGA,123519.000"));
        assert!(text.contains("GPDBT"));
    }

    #[test]
    fn skip_broken_drops_corrupt_sentences_entirely() {
        let mut framer = NmeaFramer::new(true);
        let mut corrupt = with_crc("$GPGGA,123519.000,4807.038,N,01131.000,E,1,08,0.9,545.4,M,,,,");
        corrupt.replace_range(8..9, "9"); // damage a digit, keep the old CRC

        let mut accepted = false;
        for byte in corrupt.bytes().chain(*b"\r\n") {
            accepted |= framer.push_byte(byte, 100).accepted;
        }
        assert!(!accepted);

        // A good sentence right after is unaffected by the dropped one.
        let good = with_crc("$GPGGA,123520.000,4807.038,N,01131.000,E,1,08,0.9,545.4,M,,,,");
        let mut saw_accept = false;
        for byte in good.bytes().chain(*b"\r\n") {
            saw_accept |= framer.push_byte(byte, 200).accepted;
        }
        assert!(saw_accept);
    }

    #[test]
    fn broken_sentence_passes_through_without_steering_time() {
        let mut framer = NmeaFramer::new(false);
        let gga = with_crc("$GPGGA,123519.000,4807.038,N,01131.000,E,1,08,0.9,545.4,M,,,,");
        assert!(feed(&mut framer, &gga, 100).is_empty());

        // Bad CRC with a different embedded time: appended, no flush.
        let mut lying = with_crc("$GPGGA,123599.000,4807.038,N,01131.000,E,1,08,0.9,545.4,M,,,,");
        lying.replace_range(8..9, "8");
        assert!(feed(&mut framer, &lying, 150).is_empty());

        let next = with_crc("$GPGGA,123520.000,4807.038,N,01131.000,E,1,08,0.9,545.4,M,,,,");
        let blocks = feed(&mut framer, &next, 200);
        assert_eq!(blocks.len(), 1, "group flushed only by the genuine time change");
        assert_eq!(blocks[0].data.windows(6).filter(|w| w == b"$GPGGA").count(), 2);
    }

    #[test]
    fn oversized_sentence_is_discarded() {
        let mut framer = NmeaFramer::new(false);
        for _ in 0..(MAX_SENTENCE + 10) {
            let out = framer.push_byte(b'$', 100);
            assert!(out.block.is_none());
        }
        // After the overflow the framer recovers on the next sentence.
        let good = with_crc("$GPDBT,011.0,f,003.3,M,001.8,F");
        let blocks = feed(&mut framer, &good, 200);
        assert_eq!(blocks.len(), 1);
    }

    #[test]
    fn full_block_flushes_before_overflow() {
        let mut framer = NmeaFramer::new(false);
        // Same fix time throughout, long filler payloads.
        let filler = "X".repeat(180);
        let mut blocks = Vec::new();
        for _ in 0..40 {
            let s = with_crc(&format!("$GPGGA,123519.000,{filler}"));
            blocks.extend(feed(&mut framer, &s, 100));
        }
        assert!(!blocks.is_empty(), "overflow never flushed");
        assert!(blocks.iter().all(|b| b.data.len() <= MAX_MSG_SIZE));
    }

    #[test]
    fn udp_block_validation_needs_one_good_sentence() {
        let good = with_crc("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,");
        let block = format!("{good}\r\n");
        assert!(block_has_valid_sentence(block.as_bytes()));

        let mut corrupt = block.clone().into_bytes();
        corrupt[9] ^= 0x01;
        assert!(!block_has_valid_sentence(&corrupt));

        // One valid sentence among garbage rescues the datagram.
        let mixed = format!("$GPJUNK,xx*00\r\n{good}\r\n");
        assert!(block_has_valid_sentence(mixed.as_bytes()));

        assert!(!block_has_valid_sentence(b"no nmea here"));
    }
}
