pub mod phrase;
pub mod snapshot;

pub use phrase::{now_unix, Embedding, Phrase, PhraseId, Polarity, TranslatedMap};
pub use snapshot::{CacheSnapshot, SnapshotEntry, Variant};
