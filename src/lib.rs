// Lockshot
// Unlock-triggered security snapshot daemon

pub mod models;
pub mod services;
