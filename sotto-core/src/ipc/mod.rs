//! Event types delivered to the orchestrator over broadcast channels.

pub mod events;
