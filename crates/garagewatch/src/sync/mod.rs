//! The synchronization and command-dispatch core.

mod controller;
mod message;

pub use controller::ControllerClosed;
pub use controller::ControllerHandle;
pub use controller::SyncController;
pub use controller::SyncSettings;
pub use controller::Transport;
