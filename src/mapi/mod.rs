//! MonetDB MAPI protocol client.
//!
//! This module provides a blocking MonetDB client that:
//! - Logs in with the salted challenge-response scheme (protocol 8 and 9)
//! - Frames messages into blocks of at most 8190 bytes
//! - Renders arguments as SQL literals and decodes textual result tuples
//!
//! Architecture:
//! - `protocol`: Block framing and response markers
//! - `types`: Value encoding/decoding and string escaping
//! - `auth`: Challenge-response login line
//! - `server`: Socket ownership, login and redirects
//! - `connection`: Configuration, connection handle and transactions
//! - `statement`: Placeholder binding
//! - `rows`: Response parsing and buffered result sets

pub mod auth;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod rows;
pub mod server;
pub mod statement;
pub mod types;


pub use connection::{Connection, MapiConfig, Transaction};
pub use error::{MapiError, MapiResult};
pub use rows::{parse_response, ExecResult, Response, Rows};
pub use server::{MapiServer, Server};
pub use statement::Statement;
pub use types::{escape, escape_bytes, unescape, unescape_bytes, MonetValue, TypeTag};
