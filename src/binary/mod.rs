//! Binary node codec
//!
//! Every decrypted frame carries exactly one [`Node`]. Common strings are
//! replaced by single-byte tokens and JIDs are split into user and server
//! parts, which keeps stanzas small without a schema.
//!
//! ```text
//! node    := list_start(1 + 2*attrs + has_content) string {string string} [content]
//! content := list_start(n) node*  |  binary
//! string  := token | JID_PAIR string string | AD_JID u16 string string | binary
//! ```

mod decoder;
mod encoder;
mod node;
pub mod token;

use thiserror::Error;

pub use decoder::unmarshal;
pub use encoder::marshal;
pub use node::{Attrs, Content, Node};

/// Errors raised while decoding a node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BinaryError {
    /// Input ended in the middle of a value
    #[error("Unexpected end of data")]
    UnexpectedEof,

    /// A byte that is not valid in this position
    #[error("Invalid token: {0:#x}")]
    InvalidToken(u8),

    /// Structurally invalid node
    #[error("Invalid node: {0}")]
    InvalidNode(&'static str),

    /// Bytes left after the root node
    #[error("{0} trailing bytes after node")]
    TrailingData(usize),

    /// String value was not UTF-8
    #[error("String is not valid UTF-8")]
    InvalidUtf8,
}

/// Result type for codec operations
pub type BinaryResult<T> = Result<T, BinaryError>;
