pub mod daemon;
pub mod upload;
