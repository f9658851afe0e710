// Lockshot Models
// Data structures for the daemon

mod settings;
mod snapshot;

pub use settings::*;
pub use snapshot::*;
