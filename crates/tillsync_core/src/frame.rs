//! Framed log format.
//!
//! Every log is a sequence of frames:
//!
//! ```text
//! | magic "TSLG" (4) | version u16 (2) | kind u8 (1) | len u32 (4) | body (len) | crc32 (4) |
//! ```
//!
//! Integers are little-endian. The CRC covers the header and the body.
//! Bodies are CBOR.

use crate::error::{CoreError, CoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"TSLG";

/// Current frame format version.
pub const FORMAT_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4).
pub const HEADER_SIZE: usize = 11;

/// Trailing checksum size.
pub const CRC_SIZE: usize = 4;

/// Largest body a frame may carry.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// What a frame body holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Full local record after a write.
    RecordPut = 1,
    /// A record's `synced` flag was set.
    RecordSynced = 2,
    /// A record was removed locally.
    RecordRemoved = 3,
    /// Lowest version the store may hand out next.
    VersionWatermark = 4,
    /// Full queue entry (append or coalesce).
    EntryUpsert = 10,
    /// State change of an existing queue entry.
    EntryTransition = 11,
    /// Queue entries dropped by cancellation or garbage collection.
    EntryRemoved = 12,
    /// Lowest entry id the queue may hand out next.
    EntryWatermark = 13,
    /// A quarantined frame.
    DeadLetter = 20,
}

impl FrameKind {
    /// Converts a byte to a frame kind.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::RecordPut),
            2 => Some(Self::RecordSynced),
            3 => Some(Self::RecordRemoved),
            4 => Some(Self::VersionWatermark),
            10 => Some(Self::EntryUpsert),
            11 => Some(Self::EntryTransition),
            12 => Some(Self::EntryRemoved),
            13 => Some(Self::EntryWatermark),
            20 => Some(Self::DeadLetter),
            _ => None,
        }
    }

    /// Converts the kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Builds a complete frame around `body`.
pub fn encode_frame(kind: FrameKind, body: &[u8]) -> CoreResult<Vec<u8>> {
    if body.len() > MAX_BODY_SIZE {
        return Err(CoreError::codec(format!(
            "frame body too large: {} bytes exceeds maximum of {} bytes",
            body.len(),
            MAX_BODY_SIZE
        )));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len() + CRC_SIZE);
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    buf.push(kind.as_byte());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);

    let crc = crc32fast::hash(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    Ok(buf)
}

/// Serializes a frame body.
pub fn encode_body<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(buf)
}

/// Deserializes a frame body.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(body).map_err(|e| CoreError::codec(e.to_string()))
}

/// A well-formed frame found by [`scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Offset of the frame's first byte.
    pub offset: u64,
    /// Body kind.
    pub kind: FrameKind,
    /// CBOR body.
    pub body: Vec<u8>,
}

impl Frame {
    /// Decodes the body.
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<T> {
        decode_body(&self.body)
    }
}

/// Why a complete frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DamageKind {
    /// Stored CRC does not match the contents.
    Checksum {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },
    /// Written by a newer (or unknown) format version.
    UnsupportedVersion(u16),
    /// Unknown body kind.
    UnknownKind(u8),
}

impl std::fmt::Display for DamageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DamageKind::Checksum { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected:08x}, got {actual:08x}")
            }
            DamageKind::UnsupportedVersion(v) => write!(f, "unsupported format version {v}"),
            DamageKind::UnknownKind(k) => write!(f, "unknown frame kind {k}"),
        }
    }
}

/// One item of a scanned log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanItem {
    /// A frame that passed every check.
    Frame(Frame),
    /// A complete frame that failed a check.
    Damaged {
        /// Offset of the frame's first byte.
        offset: u64,
        /// The frame's raw bytes.
        raw: Vec<u8>,
        /// What failed.
        damage: DamageKind,
    },
}

/// Result of scanning a log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Frames and damaged frames in log order.
    pub items: Vec<ScanItem>,
    /// Offset just past the last complete frame.
    pub valid_end: u64,
    /// Offset where an incomplete final frame starts.
    pub torn_tail: Option<u64>,
    /// Offset and bytes of a region that cannot be parsed as frames.
    pub unreadable: Option<(u64, Vec<u8>)>,
}

impl ScanReport {
    /// Returns true if every byte of the log is a good frame.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.torn_tail.is_none()
            && self.unreadable.is_none()
            && self.items.iter().all(|i| matches!(i, ScanItem::Frame(_)))
    }

    /// Iterates over the good frames.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.items.iter().filter_map(|item| match item {
            ScanItem::Frame(frame) => Some(frame),
            ScanItem::Damaged { .. } => None,
        })
    }
}

/// Splits raw log bytes into frames.
///
/// Scanning never fails: damage is reported in the [`ScanReport`] and the
/// caller decides whether it is fatal.
///
/// An incomplete frame at the very end is a torn tail (a write cut short by
/// a crash). Bytes that do not start with the magic, or a short frame that
/// is followed by more frames, are unreadable and end the scan.
#[must_use]
pub fn scan(data: &[u8]) -> ScanReport {
    let mut report = ScanReport::default();
    let mut pos = 0usize;

    while pos < data.len() {
        let rest = &data[pos..];
        let magic_len = rest.len().min(FRAME_MAGIC.len());
        if rest[..magic_len] != FRAME_MAGIC[..magic_len] {
            report.unreadable = Some((pos as u64, rest.to_vec()));
            break;
        }
        if rest.len() < HEADER_SIZE {
            report.torn_tail = Some(pos as u64);
            break;
        }

        let version = u16::from_le_bytes([rest[4], rest[5]]);
        let kind_byte = rest[6];
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;

        if len > MAX_BODY_SIZE {
            report.unreadable = Some((pos as u64, rest.to_vec()));
            break;
        }

        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            if find_magic(&rest[1..]).is_some() {
                report.unreadable = Some((pos as u64, rest.to_vec()));
            } else {
                report.torn_tail = Some(pos as u64);
            }
            break;
        }

        let raw = &rest[..total];
        let body_end = HEADER_SIZE + len;
        let expected = u32::from_le_bytes([
            raw[body_end],
            raw[body_end + 1],
            raw[body_end + 2],
            raw[body_end + 3],
        ]);
        let actual = crc32fast::hash(&raw[..body_end]);

        let damage = if expected != actual {
            Some(DamageKind::Checksum { expected, actual })
        } else if version == 0 || version > FORMAT_VERSION {
            Some(DamageKind::UnsupportedVersion(version))
        } else {
            FrameKind::from_byte(kind_byte)
                .map_or(Some(DamageKind::UnknownKind(kind_byte)), |_| None)
        };

        let item = match (damage, FrameKind::from_byte(kind_byte)) {
            (None, Some(kind)) => ScanItem::Frame(Frame {
                offset: pos as u64,
                kind,
                body: raw[HEADER_SIZE..body_end].to_vec(),
            }),
            (damage, _) => ScanItem::Damaged {
                offset: pos as u64,
                raw: raw.to_vec(),
                damage: damage.unwrap_or(DamageKind::UnknownKind(kind_byte)),
            },
        };
        report.items.push(item);

        pos += total;
        report.valid_end = pos as u64;
    }

    report
}

fn find_magic(data: &[u8]) -> Option<usize> {
    data.windows(FRAME_MAGIC.len())
        .position(|window| window == FRAME_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: String,
        n: u64,
    }

    fn frame(kind: FrameKind, n: u64) -> Vec<u8> {
        let body = encode_body(&Sample {
            id: "t4".into(),
            n,
        })
        .unwrap();
        encode_frame(kind, &body).unwrap()
    }

    #[test]
    fn kind_byte_roundtrip() {
        for kind in [
            FrameKind::RecordPut,
            FrameKind::RecordSynced,
            FrameKind::RecordRemoved,
            FrameKind::VersionWatermark,
            FrameKind::EntryUpsert,
            FrameKind::EntryTransition,
            FrameKind::EntryRemoved,
            FrameKind::EntryWatermark,
            FrameKind::DeadLetter,
        ] {
            assert_eq!(FrameKind::from_byte(kind.as_byte()), Some(kind));
        }
        assert_eq!(FrameKind::from_byte(99), None);
    }

    #[test]
    fn scan_reads_frames_in_order() {
        let mut data = frame(FrameKind::RecordPut, 1);
        let second_offset = data.len() as u64;
        data.extend(frame(FrameKind::RecordSynced, 2));

        let report = scan(&data);
        assert!(report.is_clean());
        assert_eq!(report.valid_end, data.len() as u64);

        let frames: Vec<_> = report.frames().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].offset, 0);
        assert_eq!(frames[1].offset, second_offset);
        assert_eq!(frames[1].kind, FrameKind::RecordSynced);
        let sample: Sample = frames[1].decode().unwrap();
        assert_eq!(sample.n, 2);
    }

    #[test]
    fn empty_log_is_clean() {
        let report = scan(&[]);
        assert!(report.is_clean());
        assert_eq!(report.valid_end, 0);
    }

    #[test]
    fn incomplete_final_frame_is_torn_tail() {
        let mut data = frame(FrameKind::RecordPut, 1);
        let good_len = data.len();
        let second = frame(FrameKind::RecordPut, 2);
        data.extend_from_slice(&second[..second.len() - 3]);

        let report = scan(&data);
        assert_eq!(report.frames().count(), 1);
        assert_eq!(report.torn_tail, Some(good_len as u64));
        assert_eq!(report.valid_end, good_len as u64);
        assert!(report.unreadable.is_none());
    }

    #[test]
    fn partial_magic_is_torn_tail() {
        let mut data = frame(FrameKind::RecordPut, 1);
        data.extend_from_slice(b"TS");
        assert!(scan(&data).torn_tail.is_some());
    }

    #[test]
    fn flipped_body_byte_is_checksum_damage() {
        let mut data = frame(FrameKind::EntryUpsert, 1);
        data.extend(frame(FrameKind::EntryUpsert, 2));
        data[HEADER_SIZE + 2] ^= 0xff;

        let report = scan(&data);
        assert_eq!(report.items.len(), 2);
        assert!(matches!(
            report.items[0],
            ScanItem::Damaged {
                offset: 0,
                damage: DamageKind::Checksum { .. },
                ..
            }
        ));
        assert!(matches!(report.items[1], ScanItem::Frame(_)));
        assert!(report.torn_tail.is_none());
    }

    #[test]
    fn newer_version_is_rejected() {
        let mut data = frame(FrameKind::RecordPut, 1);
        data[4..6].copy_from_slice(&(FORMAT_VERSION + 1).to_le_bytes());
        let body_end = data.len() - CRC_SIZE;
        let crc = crc32fast::hash(&data[..body_end]);
        data[body_end..].copy_from_slice(&crc.to_le_bytes());

        let report = scan(&data);
        assert!(matches!(
            report.items[0],
            ScanItem::Damaged {
                damage: DamageKind::UnsupportedVersion(2),
                ..
            }
        ));
    }

    #[test]
    fn garbage_is_unreadable() {
        let mut data = frame(FrameKind::RecordPut, 1);
        let good_len = data.len() as u64;
        data.extend_from_slice(b"not a frame at all");

        let report = scan(&data);
        assert_eq!(report.frames().count(), 1);
        let (offset, raw) = report.unreadable.unwrap();
        assert_eq!(offset, good_len);
        assert_eq!(raw, b"not a frame at all");
    }

    #[test]
    fn oversized_length_followed_by_frames_is_unreadable() {
        let mut data = frame(FrameKind::RecordPut, 1);
        data[7..11].copy_from_slice(&1_000_000u32.to_le_bytes());
        data.extend(frame(FrameKind::RecordPut, 2));

        let report = scan(&data);
        assert!(report.unreadable.is_some());
        assert!(report.torn_tail.is_none());
    }

    #[test]
    fn oversized_body_is_refused() {
        let body = vec![0u8; MAX_BODY_SIZE + 1];
        assert!(encode_frame(FrameKind::RecordPut, &body).is_err());
    }
}
