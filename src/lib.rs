pub mod config;
pub mod error;
pub mod fs;
pub mod state;
pub mod store;
