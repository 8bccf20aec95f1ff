//! Semantic segments, the cached result payload format and the merging of
//! time-windowed partial results.

pub mod codec;
mod entry;
mod error;
mod merge;
mod schema;
pub mod segment;

pub use codec::{decode, encode, encode_segment, encode_with, frame_len};
pub use entry::CacheEntry;
pub use error::{CodecError, MergeError, SegmentError};
pub use merge::{MergeReport, Precision, merge, merge_with_report};
pub use schema::{FieldTypes, NoSchema, StaticSchema};
pub use segment::{Segment, SegmentBuilder, build_segment, split_segment};
