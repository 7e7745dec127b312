pub mod error;
pub mod index;
pub mod search;
pub mod store;
pub mod tokenizer;

pub use error::{IndexError, Result};
pub use index::{Frequency, Posting, RankedResult};
pub use search::{SearchEngine, SearchOutcome};
pub use store::{IndexPaths, IndexReader, IndexWriter, MetaFile};
