//! Persistence layer: libSQL-backed storage for messages, derived outputs,
//! processing status, and execution logs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Database, ExecutionLogRecord, LogStatus, MessageEntity, NewMessage, OutputKind,
    ProcessingStatus, ProcessingStatusRecord,
};
