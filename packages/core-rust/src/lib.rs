//! APM collector core: typed records, merge operations, schemas, and the
//! positional wire format shared by every node of a collector cluster.

pub mod hash;
pub mod messages;
pub mod record;
pub mod schema;
pub mod time_bucket;
pub mod types;

pub use messages::{DispatchMode, RemoteData, RemoteMessage, WireError};
pub use record::{MergeError, Record, RecordError, Value};
pub use schema::{
    Column, ColumnKind, Formula, MergeOperation, Schema, SchemaBuilder, SchemaError,
    SchemaRegistry, ID_COLUMN,
};
pub use time_bucket::{record_id, TimeBucket};
pub use types::{Address, AddressParseError};
