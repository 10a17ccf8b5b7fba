//! miniSEED 3 record codec.
//!
//! Thin parser for the FDSN miniSEED 3 fixed header + primitive payload
//! encodings, just enough to move waveform segments over the bus:
//!
//! - decode: validates the CRC-32C, skips text (non-data) records, and
//!   yields one `DecodedSegment` per data record
//! - encode: writes float32 records (what the feeder publishes)
//!
//! Steim-compressed payloads are not understood and are rejected as
//! `UnsupportedEncoding`; the consumer nacks such records without requeue.

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use thiserror::Error;

// ── Wire constants ────────────────────────────────────────────────────────────

const MAGIC: &[u8; 2] = b"MS";
const FORMAT_VERSION: u8 = 3;
const FIXED_HEADER_LEN: usize = 40;

const ENC_TEXT: u8 = 0;
const ENC_I16: u8 = 1;
const ENC_I32: u8 = 3;
const ENC_F32: u8 = 4;
const ENC_F64: u8 = 5;

#[derive(Debug, Error)]
pub enum MseedError {
    #[error("record truncated at offset {0}")]
    Truncated(usize),
    #[error("bad record magic at offset {0}")]
    BadMagic(usize),
    #[error("unsupported miniSEED format version {0}")]
    UnsupportedVersion(u8),
    #[error("unsupported data encoding {0}")]
    UnsupportedEncoding(u8),
    #[error("CRC mismatch: header {header:#010x}, computed {computed:#010x}")]
    CrcMismatch { header: u32, computed: u32 },
    #[error("invalid record start time")]
    BadStartTime,
    #[error("source identifier is not UTF-8")]
    BadSid,
    #[error("payload length {payload} does not match {nsamples} samples of encoding {encoding}")]
    PayloadMismatch {
        payload: usize,
        nsamples: usize,
        encoding: u8,
    },
}

/// One decoded data record: a contiguous run of samples for one channel.
#[derive(Debug, Clone)]
pub struct DecodedSegment {
    /// Raw source identifier as stored in the record (often `FDSN:`-prefixed).
    pub sid: String,
    pub samprate: f64,
    /// Seconds since epoch of the first sample.
    pub start: f64,
    /// Seconds since epoch of the last sample (== start for empty records).
    pub end: f64,
    pub samples: Vec<f64>,
}

// ── CRC-32C (Castagnoli) ──────────────────────────────────────────────────────

const fn build_crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0x82F6_3B78
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32C_TABLE: [u32; 256] = build_crc32c_table();

pub fn crc32c(data: &[u8]) -> u32 {
    let mut crc = u32::MAX;
    for &byte in data {
        crc = (crc >> 8) ^ CRC32C_TABLE[((crc ^ byte as u32) & 0xFF) as usize];
    }
    !crc
}

// ── Decode ────────────────────────────────────────────────────────────────────

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn read_f64(buf: &[u8], at: usize) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    f64::from_le_bytes(raw)
}

/// Decode every record in `buf`. Text records are skipped; any structural
/// or CRC problem aborts the whole buffer (the caller nacks the message).
pub fn decode(buf: &[u8]) -> Result<Vec<DecodedSegment>, MseedError> {
    let mut segments = Vec::new();
    let mut offset = 0usize;

    while offset < buf.len() {
        let (segment, record_len) = decode_record(buf, offset)?;
        if let Some(segment) = segment {
            segments.push(segment);
        }
        offset += record_len;
    }

    Ok(segments)
}

fn decode_record(
    buf: &[u8],
    offset: usize,
) -> Result<(Option<DecodedSegment>, usize), MseedError> {
    let rec = &buf[offset..];
    if rec.len() < FIXED_HEADER_LEN {
        return Err(MseedError::Truncated(offset));
    }
    if &rec[0..2] != MAGIC {
        return Err(MseedError::BadMagic(offset));
    }
    if rec[2] != FORMAT_VERSION {
        return Err(MseedError::UnsupportedVersion(rec[2]));
    }

    let nanosecond = read_u32(rec, 4);
    let year = read_u16(rec, 8);
    let day_of_year = read_u16(rec, 10);
    let hour = rec[12];
    let minute = rec[13];
    let second = rec[14];
    let encoding = rec[15];
    let rate_field = read_f64(rec, 16);
    let nsamples = read_u32(rec, 24) as usize;
    let header_crc = read_u32(rec, 28);
    let sid_len = rec[33] as usize;
    let extra_len = read_u16(rec, 34) as usize;
    let payload_len = read_u32(rec, 36) as usize;

    let record_len = FIXED_HEADER_LEN + sid_len + extra_len + payload_len;
    if rec.len() < record_len {
        return Err(MseedError::Truncated(offset));
    }

    // CRC is computed over the whole record with the CRC field zeroed.
    let mut shadow = rec[..record_len].to_vec();
    shadow[28..32].fill(0);
    let computed = crc32c(&shadow);
    if computed != header_crc {
        return Err(MseedError::CrcMismatch {
            header: header_crc,
            computed,
        });
    }

    // Text records carry no waveform data.
    if encoding == ENC_TEXT {
        return Ok((None, record_len));
    }

    let sid = std::str::from_utf8(&rec[FIXED_HEADER_LEN..FIXED_HEADER_LEN + sid_len])
        .map_err(|_| MseedError::BadSid)?
        .to_string();

    let date = NaiveDate::from_yo_opt(i32::from(year), u32::from(day_of_year))
        .ok_or(MseedError::BadStartTime)?;
    let time = date
        .and_hms_opt(u32::from(hour), u32::from(minute), u32::from(second))
        .ok_or(MseedError::BadStartTime)?;
    let start = time.and_utc().timestamp() as f64 + f64::from(nanosecond) * 1e-9;

    // A negative rate field encodes a sample period.
    let samprate = if rate_field < 0.0 {
        -1.0 / rate_field
    } else {
        rate_field
    };

    let payload = &rec[FIXED_HEADER_LEN + sid_len + extra_len..record_len];
    let samples = decode_payload(payload, encoding, nsamples)?;

    let end = if samples.is_empty() || samprate <= 0.0 {
        start
    } else {
        start + (samples.len() - 1) as f64 / samprate
    };

    Ok((
        Some(DecodedSegment {
            sid,
            samprate,
            start,
            end,
            samples,
        }),
        record_len,
    ))
}

fn decode_payload(payload: &[u8], encoding: u8, nsamples: usize) -> Result<Vec<f64>, MseedError> {
    let width = match encoding {
        ENC_I16 => 2,
        ENC_I32 | ENC_F32 => 4,
        ENC_F64 => 8,
        other => return Err(MseedError::UnsupportedEncoding(other)),
    };
    if payload.len() != nsamples * width {
        return Err(MseedError::PayloadMismatch {
            payload: payload.len(),
            nsamples,
            encoding,
        });
    }

    let mut out = Vec::with_capacity(nsamples);
    for chunk in payload.chunks_exact(width) {
        let value = match encoding {
            ENC_I16 => f64::from(i16::from_le_bytes([chunk[0], chunk[1]])),
            ENC_I32 => f64::from(i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            ENC_F32 => f64::from(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])),
            ENC_F64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            }
            _ => unreachable!(),
        };
        out.push(value);
    }
    Ok(out)
}

// ── Encode ────────────────────────────────────────────────────────────────────

/// Encode one float32 data record. `start_epoch` is seconds since epoch of
/// the first sample.
pub fn encode_f32(
    sid: &str,
    start_epoch: f64,
    samprate: f64,
    samples: &[f32],
) -> Result<Vec<u8>, MseedError> {
    let micros = (start_epoch * 1e6).round() as i64;
    let start: DateTime<Utc> =
        DateTime::from_timestamp_micros(micros).ok_or(MseedError::BadStartTime)?;

    let sid_bytes = sid.as_bytes();
    let payload_len = samples.len() * 4;
    let mut rec = Vec::with_capacity(FIXED_HEADER_LEN + sid_bytes.len() + payload_len);

    rec.extend_from_slice(MAGIC);
    rec.push(FORMAT_VERSION);
    rec.push(0); // flags
    rec.extend_from_slice(&start.timestamp_subsec_nanos().to_le_bytes());
    rec.extend_from_slice(&(start.year() as u16).to_le_bytes());
    rec.extend_from_slice(&(start.ordinal() as u16).to_le_bytes());
    rec.push(start.hour() as u8);
    rec.push(start.minute() as u8);
    rec.push(start.second() as u8);
    rec.push(ENC_F32);
    rec.extend_from_slice(&samprate.to_le_bytes());
    rec.extend_from_slice(&(samples.len() as u32).to_le_bytes());
    rec.extend_from_slice(&0u32.to_le_bytes()); // CRC, filled below
    rec.push(1); // publication version
    rec.push(sid_bytes.len() as u8);
    rec.extend_from_slice(&0u16.to_le_bytes()); // no extra headers
    rec.extend_from_slice(&(payload_len as u32).to_le_bytes());
    rec.extend_from_slice(sid_bytes);
    for sample in samples {
        rec.extend_from_slice(&sample.to_le_bytes());
    }

    let crc = crc32c(&rec);
    rec[28..32].copy_from_slice(&crc.to_le_bytes());
    Ok(rec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_known_vector() {
        // RFC 3720 test vector: 32 bytes of zeros.
        assert_eq!(crc32c(&[0u8; 32]), 0x8A91_36AA);
    }

    #[test]
    fn encode_decode_round_trip() {
        let samples: Vec<f32> = (0..100).map(|i| (i as f32).sin()).collect();
        let rec = encode_f32("FDSN:XX_TEST__H_H_Z", 1_700_000_000.5, 40.0, &samples).unwrap();

        let segments = decode(&rec).unwrap();
        assert_eq!(segments.len(), 1);
        let seg = &segments[0];
        assert_eq!(seg.sid, "FDSN:XX_TEST__H_H_Z");
        assert_eq!(seg.samples.len(), 100);
        assert!((seg.samprate - 40.0).abs() < 1e-12);
        assert!((seg.start - 1_700_000_000.5).abs() < 1e-6);
        assert!((seg.end - (seg.start + 99.0 / 40.0)).abs() < 1e-6);
        for (got, want) in seg.samples.iter().zip(&samples) {
            assert!((got - f64::from(*want)).abs() < 1e-6);
        }
    }

    #[test]
    fn multiple_records_in_one_buffer() {
        let mut buf = encode_f32("FDSN:XX_A__H_H_Z", 0.0, 10.0, &[1.0; 8]).unwrap();
        buf.extend(encode_f32("FDSN:XX_B__H_H_Z", 100.0, 10.0, &[2.0; 4]).unwrap());

        let segments = decode(&buf).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].samples.len(), 8);
        assert_eq!(segments[1].samples.len(), 4);
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let mut rec = encode_f32("FDSN:XX_TEST__H_H_Z", 0.0, 10.0, &[1.0; 16]).unwrap();
        let last = rec.len() - 1;
        rec[last] ^= 0xFF;
        assert!(matches!(
            decode(&rec),
            Err(MseedError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn steim_payload_is_rejected() {
        let mut rec = encode_f32("FDSN:XX_TEST__H_H_Z", 0.0, 10.0, &[1.0; 16]).unwrap();
        rec[15] = 11; // Steim-2
        rec[28..32].fill(0);
        let crc = crc32c(&rec);
        rec[28..32].copy_from_slice(&crc.to_le_bytes());
        assert!(matches!(
            decode(&rec),
            Err(MseedError::UnsupportedEncoding(11))
        ));
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let rec = encode_f32("FDSN:XX_TEST__H_H_Z", 0.0, 10.0, &[1.0; 16]).unwrap();
        assert!(matches!(
            decode(&rec[..rec.len() - 3]),
            Err(MseedError::Truncated(_))
        ));
    }
}
