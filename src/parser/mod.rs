pub mod dot_splat;
pub mod ply;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read '{}': {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("PLY parse error: {0}")]
    Ply(String),
    #[error("invalid .splat file: {0}")]
    Splat(String),
}

pub type ParseResult<T> = Result<T, ParseError>;
