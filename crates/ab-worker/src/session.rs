use std::sync::RwLock;

use serde::Deserialize;

/// Credentials for the backend, shared by every component of one worker.
///
/// The token is replaced in place when the transport re-authenticates after a 401.
#[derive(Debug, Default)]
pub struct Session {
    token: RwLock<Option<String>>,
    login_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LoginResponse {
    #[serde(rename = "accessToken")]
    pub access_token: String,
}

impl Session {
    pub fn new(token: Option<String>, login_code: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
            login_code,
        }
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_token(&self, token: String) {
        *self
            .token
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token);
    }

    pub fn login_code(&self) -> Option<&str> {
        self.login_code.as_deref()
    }

    /// Whether a fresh token can be obtained without operator help.
    pub fn can_login(&self) -> bool {
        self.login_code.is_some()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }
}
