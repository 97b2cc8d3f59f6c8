/// Handshake authentication failures.
///
/// Both are decided before the connection is registered or any message is
/// read; the client only ever sees the HTTP status.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No `Authorization` header, wrong scheme, or an empty token.
    #[error("missing or malformed Authorization header: {0}")]
    Missing(&'static str),
    /// A well-formed token the validator does not accept.
    #[error("token rejected")]
    Invalid,
}

impl AuthError {
    /// HTTP status the handshake is rejected with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Missing(_) => 401,
            Self::Invalid => 403,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Missing(_) => "auth_missing",
            Self::Invalid => "auth_invalid",
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session backend error: {0}")]
    Backend(String),
}

/// A message handler failed outright (as opposed to answering with an error
/// reply). Contained to the connection that sent the message.
#[derive(Clone, Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("handler failed: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Session(_) => "session",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_status_mapping() {
        assert_eq!(AuthError::Missing("no header").status_code(), 401);
        assert_eq!(AuthError::Invalid.status_code(), 403);
    }

    #[test]
    fn auth_error_kinds() {
        assert_eq!(AuthError::Missing("empty token").error_kind(), "auth_missing");
        assert_eq!(AuthError::Invalid.error_kind(), "auth_invalid");
    }

    #[test]
    fn auth_missing_display_includes_reason() {
        let err = AuthError::Missing("empty token");
        assert!(err.to_string().contains("empty token"));
    }

    #[test]
    fn session_error_converts_into_handler_error() {
        let err: HandlerError = SessionError::Backend("down".into()).into();
        assert!(matches!(err, HandlerError::Session(_)));
        assert_eq!(err.error_kind(), "session");
        assert!(err.to_string().contains("down"));
    }

    #[test]
    fn internal_error_kind() {
        assert_eq!(HandlerError::Internal("x".into()).error_kind(), "internal");
    }
}
