use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("LMDB error: {0}")]
    Lmdb(#[from] heed3::Error),

    #[error("{0} cache is not open")]
    Closed(&'static str),
}
