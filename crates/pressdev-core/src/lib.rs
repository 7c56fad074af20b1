pub mod bus;
pub mod config;
pub mod error;
pub mod io;
pub mod paths;
pub mod process;
pub mod services;
pub mod status;
pub mod supervisor;
pub mod watch;

pub use error::{PressError, Result};
