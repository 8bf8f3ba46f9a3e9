pub mod app;
pub mod core;
pub mod query;
pub mod utils;
