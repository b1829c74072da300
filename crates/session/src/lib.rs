pub mod coordinator;
pub mod log;
pub mod status;
