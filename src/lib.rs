pub mod btree;
pub mod database;
pub mod error;
pub mod key;
pub mod policy;
pub mod transaction;
pub mod tx_log;
pub mod types;
pub mod utils;

pub use btree::buffer_pool::BufferPool;
pub use btree::cursor::{Cursor, Direction, HistogramSample, StoreOptions, TraverseVisitor};
pub use btree::volume::Volume;
pub use database::{Database, DbConfig};
pub use error::{DbError, ErrorKind};
pub use key::Key;
pub use policy::{JoinPolicy, SplitPolicy};
pub use transaction::Transaction;
