pub mod dispatch;
pub mod expiry;
pub mod queue;
pub mod registry;
pub mod rides;
