use stow_types::{Oid, Tid};

use crate::error::{CodecError, CodecResult};

/// Header size: 8 bytes length + 8 bytes TID + 8 bytes OID.
pub const RECORD_HEADER_SIZE: usize = 24;

/// The fixed-size front of every record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    /// Total record length, header included.
    pub length: u64,
    pub tid: Tid,
    pub oid: Oid,
}

impl RecordHeader {
    pub fn parse(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(CodecError::Truncated {
                needed: RECORD_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let word = |i: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            buf
        };
        let length = u64::from_le_bytes(word(0));
        if length < RECORD_HEADER_SIZE as u64 {
            return Err(CodecError::InvalidLength {
                declared: length,
                minimum: RECORD_HEADER_SIZE as u64,
            });
        }
        Ok(Self {
            length,
            tid: Tid::from_le_bytes(word(1)),
            oid: Oid::from_le_bytes(word(2)),
        })
    }

    pub fn payload_len(&self) -> u64 {
        self.length - RECORD_HEADER_SIZE as u64
    }

    pub fn is_tombstone(&self) -> bool {
        self.tid == Tid::TOMBSTONE
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.tid.to_le_bytes());
        out.extend_from_slice(&self.oid.to_le_bytes());
    }
}

/// One encoded object (or bookkeeping entry) as stored on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryRecord {
    pub tid: Tid,
    pub oid: Oid,
    pub payload: Vec<u8>,
}

impl BinaryRecord {
    pub fn new(tid: Tid, oid: Oid, payload: Vec<u8>) -> Self {
        Self { tid, oid, payload }
    }

    /// Marker that deletes `oid`; later than any record it supersedes.
    pub fn tombstone(oid: Oid) -> Self {
        Self::new(Tid::TOMBSTONE, oid, Vec::new())
    }

    /// The engine's root pointer, naming the OID of the root object.
    pub fn roots(root: Oid) -> Self {
        Self::new(Tid::ROOTS, Oid::ROOTS, root.to_le_bytes().to_vec())
    }

    /// Target of a roots record.
    pub fn root_target(&self) -> Option<Oid> {
        if self.tid != Tid::ROOTS || self.payload.len() != 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.payload);
        Some(Oid::from_le_bytes(buf))
    }

    pub fn is_tombstone(&self) -> bool {
        self.tid == Tid::TOMBSTONE
    }

    pub fn total_length(&self) -> u64 {
        (RECORD_HEADER_SIZE + self.payload.len()) as u64
    }

    pub fn header(&self) -> RecordHeader {
        RecordHeader {
            length: self.total_length(),
            tid: self.tid,
            oid: self.oid,
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        self.header().write_to(out);
        out.extend_from_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + self.payload.len());
        self.write_to(&mut out);
        out
    }

    /// Parse the record at the front of `bytes`. Returns the record and the
    /// number of bytes it occupied.
    pub fn parse(bytes: &[u8]) -> CodecResult<(Self, usize)> {
        let header = RecordHeader::parse(bytes)?;
        let total = usize::try_from(header.length).map_err(|_| CodecError::Truncated {
            needed: usize::MAX,
            available: bytes.len(),
        })?;
        if bytes.len() < total {
            return Err(CodecError::Truncated {
                needed: total,
                available: bytes.len(),
            });
        }
        let record = Self::new(
            header.tid,
            header.oid,
            bytes[RECORD_HEADER_SIZE..total].to_vec(),
        );
        Ok((record, total))
    }

    /// Parse a buffer that holds nothing but whole records.
    pub fn parse_all(mut bytes: &[u8]) -> CodecResult<Vec<Self>> {
        let mut records = Vec::new();
        while !bytes.is_empty() {
            let (record, used) = Self::parse(bytes)?;
            records.push(record);
            bytes = &bytes[used..];
        }
        Ok(records)
    }
}
