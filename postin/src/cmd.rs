use crate::session::Address;

// Command verbs understood by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verb {
    Helo,
    Ehlo,
    Lhlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Help,
    StartTls,
    Auth,
    XClient,
    XForward,
}

const VERBS: [Verb; 15] = [
    Verb::Helo,
    Verb::Ehlo,
    Verb::Lhlo,
    Verb::Mail,
    Verb::Rcpt,
    Verb::Data,
    Verb::Rset,
    Verb::Noop,
    Verb::Quit,
    Verb::Vrfy,
    Verb::Help,
    Verb::StartTls,
    Verb::Auth,
    Verb::XClient,
    Verb::XForward,
];

impl Verb {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Verb::Helo => "HELO",
            Verb::Ehlo => "EHLO",
            Verb::Lhlo => "LHLO",
            Verb::Mail => "MAIL",
            Verb::Rcpt => "RCPT",
            Verb::Data => "DATA",
            Verb::Rset => "RSET",
            Verb::Noop => "NOOP",
            Verb::Quit => "QUIT",
            Verb::Vrfy => "VRFY",
            Verb::Help => "HELP",
            Verb::StartTls => "STARTTLS",
            Verb::Auth => "AUTH",
            Verb::XClient => "XCLIENT",
            Verb::XForward => "XFORWARD",
        }
    }

    pub(crate) fn from_name(name: &[u8]) -> Option<Self> {
        VERBS
            .iter()
            .copied()
            .find(|v| v.name().as_bytes().eq_ignore_ascii_case(name))
    }

    // Commands that need a HELO/EHLO/LHLO first
    pub(crate) fn needs_greeting(&self) -> bool {
        matches!(self, Verb::Mail | Verb::Rcpt | Verb::Data | Verb::Auth)
    }

    // Commands that need an authenticated user when AUTH is required
    pub(crate) fn needs_user(&self) -> bool {
        matches!(self, Verb::Mail | Verb::Rcpt | Verb::Data)
    }
}

// Smtp commands sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Cmd<'a> {
    Helo {
        domain: &'a str,
    },
    Ehlo {
        domain: &'a str,
    },
    Lhlo {
        domain: &'a str,
    },
    Mail(Address),
    Rcpt(Address),
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Help,
    StartTls,
    Auth {
        mechanism: &'a str,
        initial: Option<&'a str>,
    },
    XClient(Vec<(String, String)>),
    XForward(Vec<(String, String)>),
}
