//! WebSocket bot gateway: handshake auth, connection registry and
//! supervision, background broadcast and session expiry.

pub mod auth;
pub mod handler;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod supervisor;

pub use handler::DefaultMessageHandler;
pub use registry::{Connection, ConnectionRegistry, SendError, DEFAULT_NAMESPACE};
pub use scheduler::{BroadcastQueue, BroadcastScheduler, EnqueueError};
pub use server::{build_router, start, AppState, ServerDeps, ServerHandle};
pub use settings::{load_settings, load_settings_from_path, ServerSettings, SettingsError};
pub use supervisor::{ExitReason, Supervisor};
