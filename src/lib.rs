pub mod config;
pub mod ipc;
pub mod service;
pub mod supervisor;
pub mod utils;
