pub mod coordinator;
pub mod naming;
