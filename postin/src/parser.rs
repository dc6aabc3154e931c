use crate::cmd::{Cmd, Verb};
use crate::response::{Response, BAD_PARAMETER, BAD_RECIPIENT, BAD_SENDER, SYNTAX_ERROR};
use crate::session::{Address, ParamValue};
use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_till, take_till1, take_while1, take_while_m_n},
    character::complete::{char, digit1, space0, space1},
    combinator::{eof, map, map_res, opt, rest},
    multi::{fold_many0, many0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str;

//----- Commands ---------------------------------------------------------------

// Split a line into a command verb and its arguments
pub(crate) fn split_verb(line: &[u8]) -> Option<(Verb, &[u8])> {
    let (args, name) = verb(line).ok()?;
    Verb::from_name(name).map(|v| (v, args))
}

// verb = 1*( ALPHA / DIGIT / "-" ) followed by spaces or the end of line
fn verb(buf: &[u8]) -> IResult<&[u8], &[u8]> {
    let name = take_while1(|b: u8| b.is_ascii_alphanumeric() || b == b'-');
    let separator = alt((space1, eof));
    terminated(name, separator)(buf)
}

// Parse the arguments of a command
pub(crate) fn parse_args(verb: Verb, args: &[u8]) -> Result<Cmd<'_>, Response> {
    let args = str::from_utf8(args).map_err(|_| syntax_error(verb))?;
    match verb {
        Verb::Helo => hello_domain(verb, args).map(|domain| Cmd::Helo { domain }),
        Verb::Ehlo => hello_domain(verb, args).map(|domain| Cmd::Ehlo { domain }),
        Verb::Lhlo => hello_domain(verb, args).map(|domain| Cmd::Lhlo { domain }),
        Verb::Mail => address_command("FROM", args)
            .filter(|a| valid_address(&a.address, true))
            .map(Cmd::Mail)
            .ok_or(BAD_SENDER),
        Verb::Rcpt => address_command("TO", args)
            .filter(|a| valid_address(&a.address, false))
            .map(Cmd::Rcpt)
            .ok_or(BAD_RECIPIENT),
        Verb::Auth => auth(args)
            .map(|(_, (mechanism, initial))| Cmd::Auth { mechanism, initial })
            .map_err(|_| SYNTAX_ERROR),
        Verb::XClient => attributes(args)
            .map(|(_, attrs)| Cmd::XClient(attrs))
            .map_err(|_| BAD_PARAMETER),
        Verb::XForward => attributes(args)
            .map(|(_, attrs)| Cmd::XForward(attrs))
            .map_err(|_| BAD_PARAMETER),
        Verb::Data => Ok(Cmd::Data),
        Verb::Rset => Ok(Cmd::Rset),
        Verb::Noop => Ok(Cmd::Noop),
        Verb::Quit => Ok(Cmd::Quit),
        Verb::Vrfy => Ok(Cmd::Vrfy),
        Verb::Help => Ok(Cmd::Help),
        Verb::StartTls => Ok(Cmd::StartTls),
    }
}

fn syntax_error(verb: Verb) -> Response {
    match verb {
        Verb::Mail => BAD_SENDER,
        Verb::Rcpt => BAD_RECIPIENT,
        Verb::Helo | Verb::Ehlo | Verb::Lhlo => hello_syntax(verb),
        _ => SYNTAX_ERROR,
    }
}

fn hello_syntax(verb: Verb) -> Response {
    Response::text(501, format!("Error: syntax: {} hostname", verb.name()))
}

fn hello_domain(verb: Verb, args: &str) -> Result<&str, Response> {
    token(args)
        .map(|(_, domain)| domain)
        .map_err(|_| hello_syntax(verb))
}

fn token(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_whitespace())(input)
}

//----- Addresses --------------------------------------------------------------

// Parse "FROM:<address> [KEY[=VALUE]]*" or "TO:<address> [KEY[=VALUE]]*"
pub(crate) fn address_command(keyword: &'static str, args: &str) -> Option<Address> {
    let (_, (address, params)) = address_args(keyword, args).ok()?;
    let params = if params.is_empty() {
        None
    } else {
        Some(params.into_iter().collect::<HashMap<_, _>>())
    };
    Some(Address {
        address: address.to_owned(),
        params,
    })
}

// address-args = keyword *SP ":" *SP path *( 1*SP param ) *SP
fn address_args<'a>(
    keyword: &'static str,
    input: &'a str,
) -> IResult<&'a str, (&'a str, Vec<(String, ParamValue)>)> {
    let prefix = tuple((tag_no_case(keyword), space0, char(':'), space0));
    let params = many0(preceded(space1, param));
    let parser = tuple((prefix, path, params, space0, eof));
    map(parser, |(_, path, params, _, _)| (path, params))(input)
}

// path = "<" *( any char except "<", ">" and whitespace ) ">"
fn path(input: &str) -> IResult<&str, &str> {
    let inner = take_till(|c: char| c == '<' || c == '>' || c.is_whitespace());
    delimited(char('<'), inner, char('>'))(input)
}

// param = key [ "=" xtext ]
fn param(input: &str) -> IResult<&str, (String, ParamValue)> {
    let key = take_till1(|c: char| c == '=' || c.is_whitespace());
    let value = opt(preceded(char('='), take_till(|c: char| c.is_whitespace())));
    map(pair(key, value), |(k, v)| {
        let value = match v {
            None | Some("") => ParamValue::Flag,
            Some(v) => ParamValue::Value(decode_xtext(v)),
        };
        (k.to_ascii_uppercase(), value)
    })(input)
}

// An address is empty (null sender) or local@domain
fn valid_address(address: &str, allow_empty: bool) -> bool {
    if address.is_empty() {
        return allow_empty;
    }
    let mut parts = address.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => !local.is_empty() && !domain.is_empty(),
        _ => false,
    }
}

//----- xtext ------------------------------------------------------------------

// Decode "+XX" hex escapes, any other "+" is kept
pub(crate) fn decode_xtext(value: &str) -> String {
    xtext(value)
        .map(|(_, decoded)| decoded)
        .unwrap_or_else(|_| value.to_owned())
}

// xtext = *( hexchar / 1*( any char except "+" ) / "+" )
fn xtext(input: &str) -> IResult<&str, String> {
    let piece = alt((
        map(hexchar, String::from),
        map(take_till1(|c: char| c == '+'), String::from),
        map(tag("+"), String::from),
    ));
    fold_many0(piece, String::new, |mut acc: String, piece: String| {
        acc.push_str(&piece);
        acc
    })(input)
}

// hexchar = "+" 2( DIGIT / "A"-"F" )
fn hexchar(input: &str) -> IResult<&str, char> {
    let hex = take_while_m_n(2, 2, |c: char| c.is_ascii_digit() || ('A'..='F').contains(&c));
    map_res(preceded(char('+'), hex), |h: &str| {
        u8::from_str_radix(h, 16).map(char::from)
    })(input)
}

//----- AUTH, XCLIENT and XFORWARD ---------------------------------------------

// auth = mechanism [ 1*SP initial-response ] *SP
fn auth(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    let initial = opt(preceded(space1, token));
    terminated(pair(token, initial), pair(space0, eof))(input)
}

// attributes = attribute *( 1*SP attribute ), attribute = name "=" xtext
fn attributes(input: &str) -> IResult<&str, Vec<(String, String)>> {
    let name = take_till1(|c: char| c == '=' || c.is_whitespace());
    let value = take_till(|c: char| c.is_whitespace());
    let attribute = map(
        tuple((name, char('='), value)),
        |(n, _, v): (&str, char, &str)| (n.to_ascii_uppercase(), decode_xtext(v)),
    );
    terminated(separated_list1(space1, attribute), pair(space0, eof))(input)
}

//----- PROXY ------------------------------------------------------------------

/// A PROXY protocol v1 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyHeader {
    Tcp {
        source: SocketAddr,
        destination: SocketAddr,
    },
    Unknown,
}

pub(crate) fn proxy_header(line: &[u8]) -> Option<ProxyHeader> {
    let line = str::from_utf8(line).ok()?;
    proxy(line).ok().map(|(_, header)| header)
}

// proxy = "PROXY" SP ( tcp / "UNKNOWN" *anything )
fn proxy(input: &str) -> IResult<&str, ProxyHeader> {
    let unknown = map(pair(tag("UNKNOWN"), rest), |_| ProxyHeader::Unknown);
    preceded(tag("PROXY "), alt((proxy_tcp, unknown)))(input)
}

// tcp = ( "TCP4" / "TCP6" ) SP src-ip SP dst-ip SP src-port SP dst-port
fn proxy_tcp(input: &str) -> IResult<&str, ProxyHeader> {
    let family = alt((tag("TCP4"), tag("TCP6")));
    let parser = tuple((
        family,
        preceded(char(' '), ip),
        preceded(char(' '), ip),
        preceded(char(' '), port),
        preceded(char(' '), port),
        eof,
    ));
    map_res(parser, |(family, src, dst, sport, dport, _)| {
        let v4 = family == "TCP4";
        if src.is_ipv4() != v4 || dst.is_ipv4() != v4 {
            return Err(());
        }
        Ok(ProxyHeader::Tcp {
            source: SocketAddr::new(src, sport),
            destination: SocketAddr::new(dst, dport),
        })
    })(input)
}

fn ip(input: &str) -> IResult<&str, IpAddr> {
    map_res(take_till1(|c: char| c == ' '), str::parse::<IpAddr>)(input)
}

fn port(input: &str) -> IResult<&str, u16> {
    map_res(digit1, str::parse::<u16>)(input)
}

//----- HTTP -------------------------------------------------------------------

const HTTP_METHODS: [&str; 8] = [
    "OPTIONS", "GET", "HEAD", "POST", "PUT", "DELETE", "TRACE", "CONNECT",
];

// Does the line look like "GET /path HTTP/1.1"?
pub(crate) fn is_http_request(line: &[u8]) -> bool {
    let line = match str::from_utf8(line) {
        Ok(l) => l,
        Err(_) => return false,
    };
    let (method, target) = match line.split_once(' ') {
        Some(parts) => parts,
        None => return false,
    };
    if !HTTP_METHODS.iter().any(|m| m.eq_ignore_ascii_case(method)) || !target.starts_with('/') {
        return false;
    }
    match target.rsplit_once(' ') {
        Some((_, version)) => {
            let version = version.as_bytes();
            version.len() == 8
                && version[..5].eq_ignore_ascii_case(b"HTTP/")
                && version[5].is_ascii_digit()
                && version[6] == b'.'
                && version[7].is_ascii_digit()
        }
        None => false,
    }
}

//------ Tests -----------------------------------------------------------------
