//! Type-safe cache key builders

use std::fmt;

pub const VERSION: &str = "v1";

pub mod daraja {
    use super::*;
    use uuid::Uuid;

    pub const NAMESPACE: &str = "daraja";

    /// OAuth access token of one Daraja credential
    #[derive(Debug, Clone)]
    pub struct TokenKey {
        pub credential_id: Uuid,
    }

    impl TokenKey {
        pub fn new(credential_id: Uuid) -> Self {
            Self { credential_id }
        }
    }

    impl fmt::Display for TokenKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}:token:{}", VERSION, NAMESPACE, self.credential_id)
        }
    }
}
