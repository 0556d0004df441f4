pub mod buffer;
pub mod common;
pub mod stream;
