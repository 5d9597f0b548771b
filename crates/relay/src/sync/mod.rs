pub mod coordinator;
pub mod merge;
pub mod observer;
pub mod session;
