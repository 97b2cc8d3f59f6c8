use async_trait::async_trait;

use crate::errors::HandlerError;
use crate::ids::GroupUserId;

/// Checks a bearer token against a trusted store.
///
/// Called once per handshake, concurrently from many connections.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// What a [`MessageHandler`] answers with.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    /// Sent back to the client serialized as JSON text, unchanged.
    pub payload: serde_json::Value,
    /// Group member the inbound message belonged to, when the handler could
    /// tell. Lets the server route later notifications for that member.
    pub identity: Option<GroupUserId>,
}

impl Reply {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: GroupUserId) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// Maps one inbound payload to one reply.
///
/// Malformed input should normally produce an error *reply*; returning
/// `Err` is reserved for the handler itself failing.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, raw: &str) -> Result<Reply, HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Static;

    #[async_trait]
    impl MessageHandler for Static {
        async fn handle(&self, raw: &str) -> Result<Reply, HandlerError> {
            Ok(Reply::new(serde_json::json!({ "got": raw })))
        }
    }

    struct AllowList(Vec<&'static str>);

    impl TokenValidator for AllowList {
        fn validate(&self, token: &str) -> bool {
            self.0.contains(&token)
        }
    }

    #[tokio::test]
    async fn handler_is_object_safe() {
        let handler: Box<dyn MessageHandler> = Box::new(Static);
        let reply = handler.handle("hi").await.unwrap();
        assert_eq!(reply.payload["got"], "hi");
        assert!(reply.identity.is_none());
    }

    #[test]
    fn reply_with_identity() {
        let reply = Reply::new(serde_json::Value::Null).with_identity(GroupUserId::new(3, 4));
        assert_eq!(reply.identity, Some(GroupUserId::new(3, 4)));
    }

    #[test]
    fn validator_is_object_safe() {
        let v: Box<dyn TokenValidator> = Box::new(AllowList(vec!["abc123"]));
        assert!(v.validate("abc123"));
        assert!(!v.validate("nope"));
    }
}
