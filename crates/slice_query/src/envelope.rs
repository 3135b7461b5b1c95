use crate::{
    offset::TimestampOffset,
    row_source::SerializedRow,
};

/// Wraps rows into the caller-facing envelope type and reads offsets back
/// out of it. Payload deserialization lives behind this seam.
///
/// Implementations must round-trip: for every envelope produced by
/// `create_envelope(offset, row)`, `extract_offset` returns that same
/// `offset`.
pub trait EnvelopeFactory: Send + Sync + 'static {
    type Envelope: Send;

    fn create_envelope(&self, offset: TimestampOffset, row: SerializedRow) -> Self::Envelope;

    fn extract_offset(&self, envelope: &Self::Envelope) -> TimestampOffset;
}
