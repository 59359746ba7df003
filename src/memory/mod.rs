//! 记忆层：短期（会话 FIFO）、长期（语义索引）、上下文压缩

pub mod compressor;
pub mod conversation;
pub mod long_term;

pub use compressor::{ContextCompressor, TokenEstimator, TRUNCATION_MARKER};
pub use conversation::{Message, Role, ShortTermMemory};
pub use long_term::{InMemoryIndex, IndexError, NoopIndex, SearchHit, SemanticIndex};
