pub mod coordinator;
pub mod events;
pub mod runtime;
