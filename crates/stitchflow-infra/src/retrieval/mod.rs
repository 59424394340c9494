//! Knowledge retrieval implementations.

pub mod lexical;

pub use lexical::{KbDocument, LexicalRetriever};
