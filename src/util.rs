pub mod error;
pub mod text;
pub mod vector;
