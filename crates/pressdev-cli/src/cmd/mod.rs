pub mod compose;
pub mod config;
pub mod status;
pub mod up;
