//! SASL exchanges for the AUTH command.
//!
//! Each mechanism is a small state machine driven by client lines. A
//! mechanism either asks for another line with a 334 challenge, produces an
//! `AuthAttempt` for the `Handler`, or fails back to the command state.

use crate::auth::{AuthAttempt, AuthMechanism, CramMd5, Credentials};
use crate::response::{Response, AUTH_ABORTED, INVALID_USERDATA};
use rand::Rng;
use std::str;
use std::time::{SystemTime, UNIX_EPOCH};

// base64("Username:") and base64("Password:")
const USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
const PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

// Where a SASL exchange is waiting for the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Sasl {
    Plain,
    LoginUsername,
    LoginPassword { username: String },
    CramMd5 { challenge: String },
    XOAuth2,
    // An XOAUTH2 error challenge was sent, the next line gets the final reply
    XOAuth2Failed { reply: Response },
}

// The outcome of a step in the exchange
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Challenge(Sasl, Response),
    Attempt(AuthAttempt),
    Fail(Response),
}

impl Sasl {
    // Start an exchange, with an optional initial response from the AUTH command
    pub(crate) fn start(mechanism: AuthMechanism, initial: Option<&str>, hostname: &str) -> Step {
        match (mechanism, initial) {
            (AuthMechanism::Plain, None) => Step::Challenge(Sasl::Plain, Response::text(334, "")),
            (AuthMechanism::Plain, Some(initial)) => Sasl::Plain.respond(initial.as_bytes()),
            (AuthMechanism::Login, None) => {
                Step::Challenge(Sasl::LoginUsername, Response::text(334, USERNAME_PROMPT))
            }
            (AuthMechanism::Login, Some(initial)) => {
                Sasl::LoginUsername.respond(initial.as_bytes())
            }
            (AuthMechanism::XOAuth2, None) => {
                Step::Challenge(Sasl::XOAuth2, Response::text(334, ""))
            }
            (AuthMechanism::XOAuth2, Some(initial)) => Sasl::XOAuth2.respond(initial.as_bytes()),
            (AuthMechanism::CramMd5, _) => {
                let challenge = cram_md5_challenge(hostname);
                let res = Response::text(334, base64::encode(&challenge));
                Step::Challenge(Sasl::CramMd5 { challenge }, res)
            }
        }
    }

    // Handle a line sent by the client during the exchange
    pub(crate) fn respond(self, line: &[u8]) -> Step {
        let line = trim(line);
        if let Sasl::XOAuth2Failed { reply } = self {
            return Step::Fail(reply);
        }
        if line == b"*" {
            return Step::Fail(AUTH_ABORTED);
        }
        let decoded = match decode(line) {
            Some(d) => d,
            None => return Step::Fail(INVALID_USERDATA),
        };
        match self {
            Sasl::Plain => plain(&decoded),
            Sasl::LoginUsername => Step::Challenge(
                Sasl::LoginPassword { username: decoded },
                Response::text(334, PASSWORD_PROMPT),
            ),
            Sasl::LoginPassword { username } => Step::Attempt(AuthAttempt {
                mechanism: AuthMechanism::Login,
                credentials: Credentials::Login {
                    username,
                    password: decoded,
                },
            }),
            Sasl::CramMd5 { challenge } => cram_md5(&decoded, challenge),
            Sasl::XOAuth2 => xoauth2(&decoded),
            Sasl::XOAuth2Failed { reply } => Step::Fail(reply),
        }
    }
}

fn trim(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &line[start..end]
}

// Decode a base64 response into a UTF-8 string
fn decode(line: &[u8]) -> Option<String> {
    let bytes = base64::decode(line).ok()?;
    String::from_utf8(bytes).ok()
}

// authzid NUL authcid NUL passwd
fn plain(decoded: &str) -> Step {
    let fields: Vec<&str> = decoded.split('\0').collect();
    match fields.as_slice() {
        [authorization_id, authentication_id, password] => Step::Attempt(AuthAttempt {
            mechanism: AuthMechanism::Plain,
            credentials: Credentials::Plain {
                authorization_id: (*authorization_id).to_owned(),
                authentication_id: (*authentication_id).to_owned(),
                password: (*password).to_owned(),
            },
        }),
        _ => Step::Fail(INVALID_USERDATA),
    }
}

// username SP hex-digest
fn cram_md5(decoded: &str, challenge: String) -> Step {
    match decoded.rsplit_once(' ') {
        Some((username, digest)) if !username.is_empty() && !digest.is_empty() => {
            Step::Attempt(AuthAttempt {
                mechanism: AuthMechanism::CramMd5,
                credentials: Credentials::CramMd5(CramMd5 {
                    username: username.to_owned(),
                    challenge,
                    response: digest.to_owned(),
                }),
            })
        }
        _ => Step::Fail(INVALID_USERDATA),
    }
}

// "user=" user ^A "auth=Bearer " token ^A ^A
fn xoauth2(decoded: &str) -> Step {
    let mut username = None;
    let mut access_token = None;
    for field in decoded.split('\x01') {
        if let Some(user) = field.strip_prefix("user=") {
            username = Some(user);
        } else if let Some(auth) = field.strip_prefix("auth=") {
            access_token = auth
                .split_once(' ')
                .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
                .map(|(_, token)| token);
        }
    }
    match (username, access_token) {
        (Some(username), Some(access_token)) => Step::Attempt(AuthAttempt {
            mechanism: AuthMechanism::XOAuth2,
            credentials: Credentials::XOAuth2 {
                username: username.to_owned(),
                access_token: access_token.to_owned(),
            },
        }),
        _ => Step::Fail(INVALID_USERDATA),
    }
}

// <random.timestamp@hostname>
fn cram_md5_challenge(hostname: &str) -> String {
    let random: u32 = rand::thread_rng().gen_range(10_000_000..100_000_000);
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("<{}.{}@{}>", random, timestamp, hostname)
}

//------ Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Action;
    use hmac::{Hmac, Mac};
    use md5::Md5;
    use pretty_assertions::assert_eq;

    fn challenge_text(res: &Response) -> String {
        assert_eq!(res.code, 334);
        String::from_utf8(base64::decode(res.message()).unwrap()).unwrap()
    }

    #[test]
    fn plain_initial() {
        let step = Sasl::start(AuthMechanism::Plain, Some("AHRlc3R1c2VyAHRlc3RwYXNz"), "mx");
        let expected = AuthAttempt {
            mechanism: AuthMechanism::Plain,
            credentials: Credentials::Plain {
                authorization_id: String::new(),
                authentication_id: "testuser".to_owned(),
                password: "testpass".to_owned(),
            },
        };
        assert_eq!(step, Step::Attempt(expected));
    }

    #[test]
    fn plain_challenge() {
        let step = Sasl::start(AuthMechanism::Plain, None, "mx");
        let state = match step {
            Step::Challenge(state, res) => {
                assert_eq!(res.code, 334);
                assert_eq!(res.message(), "");
                state
            }
            other => panic!("unexpected {:?}", other),
        };
        let encoded = base64::encode("admin\0testuser\0testpass");
        match state.respond(encoded.as_bytes()) {
            Step::Attempt(attempt) => {
                assert_eq!(attempt.username(), "testuser");
                assert!(attempt.validate_password("testpass"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn plain_bad_fields() {
        let encoded = base64::encode("testuser\0testpass");
        assert_eq!(
            Sasl::Plain.respond(encoded.as_bytes()),
            Step::Fail(INVALID_USERDATA)
        );
        assert_eq!(Sasl::Plain.respond(b"!!!"), Step::Fail(INVALID_USERDATA));
    }

    #[test]
    fn login() {
        let step = Sasl::start(AuthMechanism::Login, None, "mx");
        let state = match step {
            Step::Challenge(state, res) => {
                assert_eq!(challenge_text(&res), "Username:");
                state
            }
            other => panic!("unexpected {:?}", other),
        };
        let state = match state.respond(base64::encode("testuser").as_bytes()) {
            Step::Challenge(state, res) => {
                assert_eq!(challenge_text(&res), "Password:");
                state
            }
            other => panic!("unexpected {:?}", other),
        };
        let expected = AuthAttempt {
            mechanism: AuthMechanism::Login,
            credentials: Credentials::Login {
                username: "testuser".to_owned(),
                password: "testpass".to_owned(),
            },
        };
        assert_eq!(
            state.respond(base64::encode("testpass").as_bytes()),
            Step::Attempt(expected)
        );
    }

    #[test]
    fn login_initial_username() {
        let initial = base64::encode("testuser");
        match Sasl::start(AuthMechanism::Login, Some(&initial), "mx") {
            Step::Challenge(Sasl::LoginPassword { username }, res) => {
                assert_eq!(username, "testuser");
                assert_eq!(challenge_text(&res), "Password:");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn abort() {
        assert_eq!(Sasl::LoginUsername.respond(b"*"), Step::Fail(AUTH_ABORTED));
        let state = Sasl::LoginPassword {
            username: "u".to_owned(),
        };
        assert_eq!(state.respond(b"*\r\n"), Step::Fail(AUTH_ABORTED));
        assert_eq!(AUTH_ABORTED.action, Action::Reply);
    }

    #[test]
    fn cram_md5() {
        let step = Sasl::start(AuthMechanism::CramMd5, None, "mx.example.org");
        let (state, challenge) = match step {
            Step::Challenge(state, res) => {
                let challenge = challenge_text(&res);
                (state, challenge)
            }
            other => panic!("unexpected {:?}", other),
        };
        assert!(challenge.starts_with('<'));
        assert!(challenge.ends_with("@mx.example.org>"));
        let mut mac = Hmac::<Md5>::new_from_slice(b"testpass").unwrap();
        mac.update(challenge.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        let response = base64::encode(format!("testuser {}", digest));
        match state.respond(response.as_bytes()) {
            Step::Attempt(attempt) => {
                assert_eq!(attempt.mechanism, AuthMechanism::CramMd5);
                assert_eq!(attempt.username(), "testuser");
                assert!(attempt.validate_password("testpass"));
                assert!(!attempt.validate_password("wrong"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn cram_md5_challenges_differ() {
        let a = cram_md5_challenge("mx");
        let b = cram_md5_challenge("mx");
        assert_ne!(a, b);
    }

    #[test]
    fn xoauth2() {
        let token = base64::encode("user=testuser\x01auth=Bearer testtoken\x01\x01");
        let expected = AuthAttempt {
            mechanism: AuthMechanism::XOAuth2,
            credentials: Credentials::XOAuth2 {
                username: "testuser".to_owned(),
                access_token: "testtoken".to_owned(),
            },
        };
        assert_eq!(
            Sasl::start(AuthMechanism::XOAuth2, Some(&token), "mx"),
            Step::Attempt(expected)
        );
    }

    #[test]
    fn xoauth2_missing_token() {
        let token = base64::encode("user=testuser\x01\x01");
        assert_eq!(
            Sasl::XOAuth2.respond(token.as_bytes()),
            Step::Fail(INVALID_USERDATA)
        );
    }

    #[test]
    fn xoauth2_failed_ack() {
        let reply = Response::text(535, "Username and Password not accepted");
        let state = Sasl::XOAuth2Failed {
            reply: reply.clone(),
        };
        assert_eq!(state.respond(b""), Step::Fail(reply));
    }
}
