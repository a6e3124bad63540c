// SPDX-FileCopyrightText: 2023 Jade Lovelace
//
// SPDX-License-Identifier: MPL-2.0

//! Authentication collaborators.

use std::collections::HashMap;
use std::time::Duration;

/// Privilege bit the gateway asks for when logging a tunnel in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Privilege {
    Exchange,
}

/// Successful login result.
#[derive(Clone, Debug, Default)]
pub struct AuthMeta {
    /// Canonicalized username.
    pub username: String,
    /// Storage path for the mailbox. Empty means the account is
    /// misconfigured and the tunnel is refused.
    pub maildir: String,
    pub lang: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct AuthRejected {
    pub reason: String,
}

/// The authentication backend. External; queried with cleartext Basic
/// credentials.
pub trait AuthBackend: Send + Sync {
    fn login(
        &self,
        username: &str,
        password: &str,
        privilege: Privilege,
    ) -> Result<AuthMeta, AuthRejected>;
}

/// User filtering and temporary blocking, both optional concerns of the
/// surrounding system.
pub trait UserGuard: Send + Sync {
    /// Whether this user may attempt a login at all.
    fn permitted(&self, _username: &str) -> bool {
        true
    }

    /// Called when a user exhausted its auth attempts.
    fn hold(&self, _username: &str, _duration: Duration) {}
}

/// A guard that filters nothing and blocks nobody.
pub struct OpenGuard;

impl UserGuard for OpenGuard {}

/// Fixed user table for tests and demo wiring.
pub struct StaticAuth {
    users: HashMap<String, (String, AuthMeta)>,
}

impl StaticAuth {
    pub fn new() -> StaticAuth {
        StaticAuth {
            users: HashMap::new(),
        }
    }

    pub fn user(mut self, username: &str, password: &str, maildir: &str) -> StaticAuth {
        self.users.insert(
            username.to_string(),
            (
                password.to_string(),
                AuthMeta {
                    username: username.to_string(),
                    maildir: maildir.to_string(),
                    lang: String::new(),
                },
            ),
        );
        self
    }
}

impl Default for StaticAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthBackend for StaticAuth {
    fn login(
        &self,
        username: &str,
        password: &str,
        _privilege: Privilege,
    ) -> Result<AuthMeta, AuthRejected> {
        match self.users.get(username) {
            Some((pass, meta)) if pass == password => Ok(meta.clone()),
            _ => Err(AuthRejected {
                reason: "unknown user or bad password".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_auth_accepts_and_rejects() {
        let auth = StaticAuth::new().user("u", "p", "/m/u");
        assert_eq!(
            auth.login("u", "p", Privilege::Exchange).unwrap().maildir,
            "/m/u"
        );
        assert!(auth.login("u", "wrong", Privilege::Exchange).is_err());
        assert!(auth.login("ghost", "p", Privilege::Exchange).is_err());
    }
}
