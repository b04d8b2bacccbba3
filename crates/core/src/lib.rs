//! Core types, table schema, and message decoding for the ingestion worker.

pub mod decode;
pub mod error;
pub mod message;
pub mod record;
pub mod schema;
pub mod state;

pub use decode::{DecodeError, MessageDecoder};
pub use error::{Error, Result};
pub use message::*;
pub use record::*;
pub use schema::*;
pub use state::ConnectionState;
