use hmac::{Hmac, Mac};
use md5::Md5;
use serde::Serialize;

type HmacMd5 = Hmac<Md5>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Supported authentication mechanisms
pub enum AuthMechanism {
    /// Plain user/password, RFC 4616
    Plain,
    /// Username and password sent in separate base64 responses
    Login,
    /// OAuth 2.0 bearer token
    XOAuth2,
    /// Challenge/response with an HMAC-MD5 digest, RFC 2195
    CramMd5,
}

impl AuthMechanism {
    /// The SASL name of the mechanism
    pub fn name(&self) -> &'static str {
        match self {
            AuthMechanism::Plain => "PLAIN",
            AuthMechanism::Login => "LOGIN",
            AuthMechanism::XOAuth2 => "XOAUTH2",
            AuthMechanism::CramMd5 => "CRAM-MD5",
        }
    }

    /// Look up a mechanism by its SASL name, ignoring case
    pub fn from_name(name: &str) -> Option<Self> {
        [
            AuthMechanism::Plain,
            AuthMechanism::Login,
            AuthMechanism::XOAuth2,
            AuthMechanism::CramMd5,
        ]
        .into_iter()
        .find(|m| m.name().eq_ignore_ascii_case(name))
    }

    // Mechanisms that can be used on an unencrypted connection
    pub(crate) fn allowed_insecure(&self) -> bool {
        matches!(self, AuthMechanism::Plain | AuthMechanism::Login)
    }
}

/// Decoded client credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// AUTH PLAIN
    Plain {
        /// Identity to act as, usually empty
        authorization_id: String,
        /// Identity whose password is given
        authentication_id: String,
        /// Password
        password: String,
    },
    /// AUTH LOGIN
    Login {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// AUTH XOAUTH2
    XOAuth2 {
        /// Username
        username: String,
        /// Bearer token
        access_token: String,
    },
    /// AUTH CRAM-MD5
    CramMd5(CramMd5),
}

/// A CRAM-MD5 response to a server challenge.
///
/// The password is never sent by the client, instead a `Handler` checks
/// a candidate password with `validate_password`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CramMd5 {
    /// Username
    pub username: String,
    /// The challenge that was sent to the client
    pub challenge: String,
    /// The hex digest sent by the client
    pub response: String,
}

impl CramMd5 {
    /// Does the client digest match the given password?
    pub fn validate_password(&self, password: &str) -> bool {
        let digest = match hex::decode(&self.response) {
            Ok(d) => d,
            Err(_) => return false,
        };
        let mut mac = match HmacMd5::new_from_slice(password.as_bytes()) {
            Ok(m) => m,
            Err(_) => return false,
        };
        mac.update(self.challenge.as_bytes());
        mac.verify_slice(&digest).is_ok()
    }
}

/// An authentication attempt passed to `Handler::auth`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttempt {
    /// The mechanism used by the client
    pub mechanism: AuthMechanism,
    /// The decoded credentials
    pub credentials: Credentials,
}

impl AuthAttempt {
    /// The username in the credentials, for PLAIN this is the authentication id
    pub fn username(&self) -> &str {
        match &self.credentials {
            Credentials::Plain {
                authentication_id, ..
            } => authentication_id,
            Credentials::Login { username, .. } => username,
            Credentials::XOAuth2 { username, .. } => username,
            Credentials::CramMd5(cram) => &cram.username,
        }
    }

    /// Check a password against the credentials.
    ///
    /// Works for every mechanism except XOAUTH2, which carries a token.
    pub fn validate_password(&self, expected: &str) -> bool {
        match &self.credentials {
            Credentials::Plain { password, .. } | Credentials::Login { password, .. } => {
                password == expected
            }
            Credentials::CramMd5(cram) => cram.validate_password(expected),
            Credentials::XOAuth2 { .. } => false,
        }
    }
}

/// The JSON error sent to XOAUTH2 clients, see the Gmail XOAUTH2 protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OAuthError {
    /// HTTP style status, e.g. "401"
    pub status: String,
    /// Supported schemes, e.g. "bearer"
    pub schemes: String,
    /// Required scope
    pub scope: String,
}

impl OAuthError {
    // The base64 encoded JSON challenge
    pub(crate) fn encode(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        base64::encode(json)
    }
}

//------ Tests -----------------------------------------------------------------
