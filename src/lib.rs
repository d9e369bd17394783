pub mod callstack;
pub mod config;
pub mod driver;
pub mod event;
pub mod outlier;
pub mod ps;
pub mod reader;
pub mod sink;
pub mod stats;
