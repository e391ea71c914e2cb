// Tue Feb 3 2026 - Alex

use crate::memory::Address;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("read of {len} bytes at {address} is out of bounds")]
    OutOfBounds { address: Address, len: usize },
    #[error("no NUL terminator within {max_len} bytes at {address}")]
    UnterminatedString { address: Address, max_len: usize },
    #[error("string at {address} is not valid ASCII")]
    InvalidString { address: Address },
    #[error("binary parse error: {0}")]
    BinaryParse(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
