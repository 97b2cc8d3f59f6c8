pub mod errors;
pub mod handler;
pub mod ids;
pub mod security;
pub mod session;

pub use errors::{AuthError, HandlerError, SessionError};
pub use handler::{MessageHandler, Reply, TokenValidator};
pub use ids::{ConnectionId, GroupUserId};
pub use security::BotToken;
pub use session::{Session, SessionStore};
