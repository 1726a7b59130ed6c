pub mod backup;
pub mod connection;
