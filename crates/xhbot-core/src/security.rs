use secrecy::{ExposeSecret, SecretString};

/// Bearer credential presented by the bot frontend at handshake time.
///
/// Redacted in Debug and zeroized on drop; only the validator ever looks at
/// the plaintext.
#[derive(Clone)]
pub struct BotToken(SecretString);

impl BotToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for BotToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BotToken([REDACTED])")
    }
}

/// Scheme accepted in the `Authorization` header, matched case-insensitively.
pub const TOKEN_SCHEME: &str = "token";

/// Parse an `Authorization` header value of the form `Token <value>`.
///
/// Returns `None` for any other scheme or when the value is blank after
/// trimming.
pub fn parse_token_header(header: &str) -> Option<BotToken> {
    let (scheme, rest) = header.split_at_checked(TOKEN_SCHEME.len())?;
    if !scheme.eq_ignore_ascii_case(TOKEN_SCHEME) || !rest.starts_with(' ') {
        return None;
    }
    let token = rest.trim();
    if token.is_empty() {
        return None;
    }
    Some(BotToken::new(token))
}
