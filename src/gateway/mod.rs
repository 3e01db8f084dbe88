pub mod admission;
pub mod events;
pub mod limiter;
pub mod matches;
pub mod presence;
pub mod registry;
pub mod server;
pub mod session;
pub mod sink;
