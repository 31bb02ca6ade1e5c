pub mod bridge;
pub mod config;
pub mod error;
pub mod health;
pub mod logs;
pub mod platform;
pub mod runtime;
pub mod startup;
pub mod supervisor;
