#[macro_use]
extern crate async_trait;

pub mod channel;
pub mod chunk;
pub mod config;
pub mod delete;
pub mod engine;
pub mod error;
pub mod growing;
pub mod index;
pub mod lock;
pub mod merge;
pub mod metadata;
pub mod partition;
pub mod query;

pub use channel::{ChannelDefinition, ChannelValue, DataType, LogHeader, LogId};
pub use config::{ConfigHandle, EngineConfig};
pub use delete::{DeleteRequest, DeleteScope};
pub use engine::ChannelDataEngine;
pub use error::{Error, ErrorKind, Result};
pub use growing::{GrowingObjectManager, SweepStats};
pub use index::{Direction, IndexArg, IndexType, IndexValue};
pub use merge::{ChannelRange, MergeRequest, MergeResult};
pub use metadata::{ChannelMetadata, GrowingRecord, LogMetadata};
pub use query::{ChunkScanner, QueryRequest, QueryResult};
