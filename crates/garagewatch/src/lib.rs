pub mod api;
pub mod config;
pub mod entity;
pub mod error;
pub mod relay;
pub mod remote;
pub mod store;
pub mod sync;

pub use config::Config;
pub use config::LogLevel;
pub use config::OperatingMode;
pub use entity::Entity;
pub use entity::EntityState;
pub use error::SyncError;
pub use store::CommandStatus;
pub use store::Snapshot;
pub use sync::ControllerHandle;
pub use sync::SyncController;
pub use sync::SyncSettings;
pub use sync::Transport;
