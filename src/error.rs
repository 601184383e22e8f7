use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Bad file signature")]
    BadFileSignature,

    #[error("Block too large: {0} bytes")]
    BlockTooLarge(usize),

    #[error("Invalid block: {0}")]
    InvalidBlock(i64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
