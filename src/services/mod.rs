// Lockshot Services
// Business logic layer

mod camera;
mod ffmpeg_camera;
mod monitor;
mod notifier;
mod orchestrator;
mod permissions;
mod persister;
mod settings_manager;
mod unlock;

pub use camera::*;
pub use ffmpeg_camera::*;
pub use monitor::*;
pub use notifier::*;
pub use orchestrator::*;
pub use permissions::*;
pub use persister::*;
pub use settings_manager::*;
pub use unlock::*;
