pub mod file_backend;
pub mod piece_store;

pub use file_backend::{FileBackend, FileHandle, FileSet, FileSlice, FileSpan, StdFileBackend};
pub use piece_store::{PieceOutcome, PieceStore};
