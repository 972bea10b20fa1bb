pub mod client;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod manager;
pub mod scheduler;
pub mod shutdown;
pub mod slavedriver;
pub mod transport;
pub mod worker;
