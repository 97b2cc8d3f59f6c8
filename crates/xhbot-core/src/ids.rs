use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(ConnectionId, "conn");

/// A member of a remote chat group, as seen by the bot frontend.
///
/// Stable across reconnects, so it keys the session store rather than the
/// connection that happened to carry the message.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct GroupUserId {
    pub group_id: i64,
    pub user_id: i64,
}

impl GroupUserId {
    pub fn new(group_id: i64, user_id: i64) -> Self {
        Self { group_id, user_id }
    }
}

impl fmt::Display for GroupUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.group_id, self.user_id)
    }
}

impl FromStr for GroupUserId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (group, user) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <group_id>:<user_id>, got {s:?}"))?;
        let group_id = group
            .parse()
            .map_err(|e| format!("invalid group id {group:?}: {e}"))?;
        let user_id = user
            .parse()
            .map_err(|e| format!("invalid user id {user:?}: {e}"))?;
        Ok(Self { group_id, user_id })
    }
}
