// Challenge acquisition, relay execution, and response classification for upstream lookups.

pub mod acquirer;
pub mod classifier;
pub mod core;
pub mod relay;
pub mod user_agents;
