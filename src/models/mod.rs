pub mod bookmark;
pub mod operation;
pub mod organize;
