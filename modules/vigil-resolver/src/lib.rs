pub mod daemon;
pub mod lock;
