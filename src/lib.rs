pub mod action;
pub mod config;
pub mod coordination;
pub mod distributor;
pub mod error;
pub mod executor;
pub mod job;
pub mod logging;
pub mod shutdown;
pub mod store;
