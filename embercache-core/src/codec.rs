//! Snapshot codec for the bin table.
//!
//! A snapshot is a self-contained byte stream:
//!
//! ```text
//! Snapshot      := BinCount(u32-LE) BinRecord{BinCount}
//! BinRecord     := AssignmentCount(u32-LE) Assignment{AssignmentCount}
//! Assignment    := LocationIdLen(u32-LE) LocationIdBytes(LocationIdLen)
//!                  HasExpiry(u8: 0 or 1) [ExpiryTicks(i64-LE)]
//! ```
//!
//! `ExpiryTicks` is UTC in 100-nanosecond units since 0001-01-01T00:00:00
//! UTC. `BinCount` must equal the engine's bin count on read; anything else
//! is rejected as corrupt.

use crate::bin_manager::BIN_COUNT;
use crate::error::{EmberError, Result};
use crate::location::LocationId;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

/// Ticks elapsed between 0001-01-01T00:00:00 UTC and the unix epoch.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// One serialized assignment: the owning location and, for tombstones, the
/// instant the assignment expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinAssignment {
    pub location: LocationId,
    pub expires_at: Option<DateTime<Utc>>,
}

impl BinAssignment {
    pub fn is_active(&self) -> bool {
        self.expires_at.is_none()
    }
}

/// A decoded snapshot of the full bin table, suitable for persistence and
/// for hand-off across replication-factor changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinMappings {
    bins: Vec<Vec<BinAssignment>>,
}

impl BinMappings {
    pub(crate) fn from_bins(bins: Vec<Vec<BinAssignment>>) -> Self {
        debug_assert_eq!(bins.len(), BIN_COUNT);
        Self { bins }
    }

    /// Per-bin assignment lists, active and tombstoned alike. The outer
    /// slice always holds every bin.
    pub fn bins(&self) -> &[Vec<BinAssignment>] {
        &self.bins
    }

    /// Total number of serialized assignments across all bins.
    pub fn assignment_count(&self) -> usize {
        self.bins.iter().map(Vec::len).sum()
    }

    /// Serializes the snapshot to its wire form.
    pub fn encode(&self) -> Bytes {
        let payload: usize = self
            .bins
            .iter()
            .flatten()
            .map(|a| 4 + a.location.len() + 1 + 8)
            .sum();
        let mut buf = BytesMut::with_capacity(4 + self.bins.len() * 4 + payload);

        buf.put_u32_le(self.bins.len() as u32);
        for bin in &self.bins {
            buf.put_u32_le(bin.len() as u32);
            for assignment in bin {
                buf.put_u32_le(assignment.location.len() as u32);
                buf.put_slice(assignment.location.as_bytes());
                match assignment.expires_at {
                    Some(expires_at) => {
                        buf.put_u8(1);
                        buf.put_i64_le(ticks_from_datetime(expires_at));
                    }
                    None => buf.put_u8(0),
                }
            }
        }

        buf.freeze()
    }

    /// Decodes a snapshot from its wire form.
    ///
    /// Malformed input (wrong bin count, truncation, impossible lengths) is
    /// reported as [`EmberError::CorruptSnapshot`]; no engine state is
    /// touched.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);

        let bin_count = reader.read_u32("bin count")? as usize;
        if bin_count != BIN_COUNT {
            return Err(EmberError::CorruptSnapshot(format!(
                "bin count {} does not match the expected {}",
                bin_count, BIN_COUNT
            )));
        }

        let mut bins = Vec::with_capacity(bin_count);
        for bin in 0..bin_count {
            let assignment_count = reader.read_u32("assignment count")? as usize;
            // Each assignment occupies at least 5 bytes on the wire.
            if assignment_count > reader.remaining() / 5 {
                return Err(EmberError::CorruptSnapshot(format!(
                    "bin {} claims {} assignments with {} bytes left",
                    bin,
                    assignment_count,
                    reader.remaining()
                )));
            }

            let mut assignments = Vec::with_capacity(assignment_count);
            for _ in 0..assignment_count {
                let id_len = reader.read_u32("location id length")? as usize;
                let id_bytes = reader.read_slice(id_len, "location id")?;
                let location = LocationId::from(id_bytes);

                let expires_at = match reader.read_u8("expiry flag")? {
                    0 => None,
                    1 => {
                        let ticks = reader.read_i64("expiry ticks")?;
                        Some(datetime_from_ticks(ticks)?)
                    }
                    other => {
                        return Err(EmberError::CorruptSnapshot(format!(
                            "expiry flag must be 0 or 1, got {}",
                            other
                        )));
                    }
                };

                assignments.push(BinAssignment {
                    location,
                    expires_at,
                });
            }
            bins.push(assignments);
        }

        if reader.remaining() != 0 {
            return Err(EmberError::CorruptSnapshot(format!(
                "{} trailing bytes after the last bin",
                reader.remaining()
            )));
        }

        Ok(Self { bins })
    }
}

/// Converts a UTC instant to 100-nanosecond ticks since 0001-01-01 UTC.
/// Sub-tick precision is truncated.
pub(crate) fn ticks_from_datetime(at: DateTime<Utc>) -> i64 {
    at.timestamp() * TICKS_PER_SECOND
        + i64::from(at.timestamp_subsec_nanos() / 100)
        + UNIX_EPOCH_TICKS
}

pub(crate) fn datetime_from_ticks(ticks: i64) -> Result<DateTime<Utc>> {
    let unix_ticks = ticks - UNIX_EPOCH_TICKS;
    let secs = unix_ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (unix_ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .ok_or_else(|| EmberError::CorruptSnapshot(format!("expiry ticks {} out of range", ticks)))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn read_slice(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(EmberError::CorruptSnapshot(format!(
                "truncated stream reading {} ({} bytes needed, {} left)",
                what,
                len,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.read_slice(1, what)?[0])
    }

    fn read_u32(&mut self, what: &str) -> Result<u32> {
        let bytes = self.read_slice(4, what)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn read_i64(&mut self, what: &str) -> Result<i64> {
        let bytes = self.read_slice(8, what)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn empty_bins() -> Vec<Vec<BinAssignment>> {
        vec![Vec::new(); BIN_COUNT]
    }

    #[test]
    fn unix_epoch_tick_offset() {
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        assert_eq!(ticks_from_datetime(epoch), UNIX_EPOCH_TICKS);
        assert_eq!(datetime_from_ticks(UNIX_EPOCH_TICKS).unwrap(), epoch);
    }

    #[test]
    fn ticks_round_trip_at_tick_precision() {
        let at = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 59).unwrap()
            + chrono::Duration::nanoseconds(123_456_700);
        let ticks = ticks_from_datetime(at);
        assert_eq!(datetime_from_ticks(ticks).unwrap(), at);
    }

    #[test]
    fn sub_tick_precision_truncates() {
        let at = Utc.with_ymd_and_hms(2024, 5, 17, 8, 30, 59).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let truncated = datetime_from_ticks(ticks_from_datetime(at)).unwrap();
        assert_eq!(at - truncated, chrono::Duration::nanoseconds(89));
    }

    #[test]
    fn encode_decode_round_trips_bytes() {
        let mut bins = empty_bins();
        bins[0].push(BinAssignment {
            location: LocationId::from("edge/node-1"),
            expires_at: None,
        });
        bins[0].push(BinAssignment {
            location: LocationId::from("edge/node-2"),
            expires_at: Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()),
        });
        bins[65535].push(BinAssignment {
            location: LocationId::from(vec![0xff, 0x00, 0x7f]),
            expires_at: None,
        });

        let mappings = BinMappings::from_bins(bins);
        let encoded = mappings.encode();
        let decoded = BinMappings::decode(&encoded).unwrap();
        assert_eq!(decoded, mappings);
        assert_eq!(decoded.encode(), encoded);
        assert_eq!(decoded.assignment_count(), 3);
    }

    #[test]
    fn rejects_wrong_bin_count() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2048);
        let err = BinMappings::decode(&buf).unwrap_err();
        assert!(matches!(err, EmberError::CorruptSnapshot(_)));
    }

    #[test]
    fn rejects_truncated_stream() {
        let mappings = BinMappings::from_bins(empty_bins());
        let encoded = mappings.encode();
        let err = BinMappings::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, EmberError::CorruptSnapshot(_)));
    }

    #[test]
    fn rejects_overlong_assignment_count() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(BIN_COUNT as u32);
        buf.put_u32_le(u32::MAX);
        let err = BinMappings::decode(&buf).unwrap_err();
        assert!(matches!(err, EmberError::CorruptSnapshot(_)));
    }

    #[test]
    fn rejects_bad_expiry_flag() {
        let mut bins = empty_bins();
        // Last bin, so the expiry flag is the final byte of the stream.
        bins[BIN_COUNT - 1].push(BinAssignment {
            location: LocationId::from("n"),
            expires_at: None,
        });
        let encoded = BinMappings::from_bins(bins).encode();
        let mut bytes = encoded.to_vec();
        let flag_at = bytes.len() - 1;
        bytes[flag_at] = 2;
        let err = BinMappings::decode(&bytes).unwrap_err();
        assert!(matches!(err, EmberError::CorruptSnapshot(_)));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let encoded = BinMappings::from_bins(empty_bins()).encode();
        let mut bytes = encoded.to_vec();
        bytes.push(0);
        let err = BinMappings::decode(&bytes).unwrap_err();
        assert!(matches!(err, EmberError::CorruptSnapshot(_)));
    }
}
