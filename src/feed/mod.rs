//! Feed document decoding and the result envelope.
//!
//! - [`parser`] - maps RSS/Atom/JSON Feed bytes onto [`FeedDocument`] via `feed-rs`,
//!   applying the item cap, guid blacklist and age filter
//! - [`output`] - the serializable [`FeedOutput`] returned to callers

mod output;
mod parser;

pub use output::FeedOutput;
pub use parser::{
    DecodeError, DecodeOptions, Enclosure, FeedDecoder, FeedDocument, FeedItem, FeedRsDecoder,
    ItemFilters,
};
