//! Binary record codec for stowage.
//!
//! Every stored object becomes one length-prefixed [`BinaryRecord`]:
//!
//! ```text
//! [8 bytes: total record length (LE u64)]
//! [8 bytes: type id (LE u64)]
//! [8 bytes: object id (LE u64)]
//! [payload: fields in layout order]
//! ```
//!
//! Primitive fields are written at their fixed width, byte and text fields
//! as a `u64` length followed by the bytes, references as the 8-byte OID of
//! the target (0 for null), and reference lists as a `u64` count followed by
//! OIDs. The [`Storer`] walks an object graph and renders the records a
//! store needs; [`decode_record`] turns a record back into field values
//! under the current layout of its type.

pub mod decode;
pub mod encode;
pub mod error;
pub mod record;
pub mod storer;

pub use decode::{decode_payload, decode_record, referenced_oids, DecodedEntity};
pub use encode::encode_payload;
pub use error::{CodecError, CodecResult};
pub use record::{BinaryRecord, RecordHeader, RECORD_HEADER_SIZE};
pub use storer::{StoreBatch, StoreMode, Storer, StubPolicy};
