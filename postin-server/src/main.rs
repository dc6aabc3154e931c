use anyhow::{anyhow, bail, Context, Error};
use getopts::Options;
use log::info;
use postin_embedded::{
    AuthAttempt, AuthMechanism, AuthResult, DataSummary, Reject, Server, Session, SslConfig,
};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use std::env;
use std::fs::File;
use std::path::Path;
use time::format_description;
use time::OffsetDateTime;

const DOMAIN: &str = "localhost";
const DEFAULT_WORKING_DIR: &str = ".";
const DEFAULT_ADDRESS: &str = "127.0.0.1:8025";

// Command line option names
const OPT_HELP: &str = "help";
const OPT_ADDRESS: &str = "address";
const OPT_LOG: &str = "log";
const OPT_SERVER: &str = "server";
const OPT_SSL_CERT: &str = "ssl-cert";
const OPT_SSL_KEY: &str = "ssl-key";
const OPT_SSL_CHAIN: &str = "ssl-chain";
const OPT_SECURE: &str = "secure";
const OPT_PROXY: &str = "proxy";
const OPT_MAX_SIZE: &str = "max-size";
const OPT_AUTH: &str = "auth";

// Accepts all mail and throws it away
#[derive(Clone)]
struct Handler {
    credentials: Option<(String, String)>,
    max_size: Option<usize>,
}

impl postin_embedded::Handler for Handler {
    fn auth(&mut self, attempt: &AuthAttempt, _session: &Session) -> AuthResult {
        match &self.credentials {
            Some((user, password))
                if attempt.username() == user && attempt.validate_password(password) =>
            {
                AuthResult::Ok(user.clone())
            }
            _ => AuthResult::InvalidCredentials,
        }
    }

    fn data_end(
        &mut self,
        summary: &DataSummary,
        session: &Session,
    ) -> Result<Option<String>, Reject> {
        let from = session
            .envelope
            .mail_from
            .as_ref()
            .map_or("", |a| a.address.as_str());
        let to: Vec<&str> = session
            .envelope
            .rcpt_to
            .iter()
            .map(|a| a.address.as_str())
            .collect();
        info!(
            "[{}] Message from <{}> to {:?}, {} bytes",
            session.id, from, to, summary.size
        );
        match self.max_size {
            Some(max_size) if summary.size_exceeded => Err(Reject::size_exceeded(max_size)),
            _ => Ok(None),
        }
    }
}

fn setup_logger(log_dir: &str) -> Result<(), Error> {
    let log_path = Path::new(&log_dir);
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let timestamp =
        format_description::parse_borrowed::<2>("[year][month][day][hour][minute][second]")?;
    let filename = format!("smtp-{}.log", now.format(&timestamp)?);
    let filepath = log_path.join(&filename);
    let file = File::create(&filepath)
        .with_context(|| format!("Cannot create log file {}", filepath.display()))?;
    let file_config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Off)
        .build();
    let loggers: Vec<Box<dyn SharedLogger>> = vec![
        TermLogger::new(
            LevelFilter::Info,
            simplelog::Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Trace, file_config, file),
    ];
    CombinedLogger::init(loggers).map_err(|err| anyhow!("Cannot initialize logger: {}", err))
}

fn print_usage(program: &str, opts: &Options) {
    let brief = format!("Usage: {} [options]", program);
    print!("{}", opts.usage(&brief));
}

// USER:PASSWORD
fn parse_credentials(arg: &str) -> Result<(String, String), Error> {
    match arg.split_once(':') {
        Some((user, password)) if !user.is_empty() => Ok((user.to_owned(), password.to_owned())),
        _ => bail!("Expected USER:PASSWORD for --{}", OPT_AUTH),
    }
}

fn run() -> Result<(), Error> {
    let args: Vec<String> = env::args().collect();
    let mut opts = Options::new();
    opts.optflag("h", OPT_HELP, "print this help menu");
    opts.optopt("a", OPT_ADDRESS, "the address to listen on", "ADDRESS");
    opts.optopt("l", OPT_LOG, "the directory to write logs to", "LOG_DIR");
    opts.optopt("s", OPT_SERVER, "the name of the mailserver", "SERVER");
    opts.optopt("", OPT_SSL_CERT, "ssl certificate", "PEM_FILE");
    opts.optopt("", OPT_SSL_KEY, "ssl certificate key", "PEM_FILE");
    opts.optopt(
        "",
        OPT_SSL_CHAIN,
        "ssl chain of trust for the certificate",
        "PEM_FILE",
    );
    opts.optflag("", OPT_SECURE, "start connections with a TLS handshake");
    opts.optflag("", OPT_PROXY, "expect a PROXY protocol header");
    opts.optopt("", OPT_MAX_SIZE, "maximum message size in bytes", "BYTES");
    opts.optopt("", OPT_AUTH, "require authentication", "USER:PASSWORD");
    let matches = opts
        .parse(&args[1..])
        .context("Error parsing command line")?;
    if matches.opt_present(OPT_HELP) {
        print_usage(&args[0], &opts);
        return Ok(());
    }
    let log_directory = matches
        .opt_str(OPT_LOG)
        .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_owned());
    setup_logger(&log_directory)?;
    let ssl_config = match (
        matches.opt_str(OPT_SSL_CERT),
        matches.opt_str(OPT_SSL_KEY),
        matches.opt_str(OPT_SSL_CHAIN),
    ) {
        (Some(cert_path), Some(key_path), Some(chain_path)) => SslConfig::Trusted {
            cert_path,
            key_path,
            chain_path,
        },
        (Some(cert_path), Some(key_path), None) => SslConfig::SelfSigned {
            cert_path,
            key_path,
        },
        _ => SslConfig::None,
    };
    let max_size = matches
        .opt_str(OPT_MAX_SIZE)
        .map(|s| s.parse::<usize>())
        .transpose()
        .context("Invalid maximum message size")?;
    let credentials = matches
        .opt_str(OPT_AUTH)
        .map(|arg| parse_credentials(&arg))
        .transpose()?;
    let addr = matches
        .opt_str(OPT_ADDRESS)
        .unwrap_or_else(|| DEFAULT_ADDRESS.to_owned());
    let domain = matches
        .opt_str(OPT_SERVER)
        .unwrap_or_else(|| DOMAIN.to_owned());
    let handler = Handler {
        credentials: credentials.clone(),
        max_size,
    };
    let mut server = Server::new(handler);
    server.with_name(domain).with_ssl(ssl_config).with_addr(addr)?;
    if credentials.is_some() {
        server
            .with_auth(AuthMechanism::Plain)
            .with_auth(AuthMechanism::Login)
            .with_auth(AuthMechanism::CramMd5);
    }
    let builder = server.connection_builder();
    if matches.opt_present(OPT_SECURE) {
        builder.secure();
    }
    if matches.opt_present(OPT_PROXY) {
        builder.enable_proxy();
    }
    if let Some(max_size) = max_size {
        builder.max_size(max_size);
    }
    server.serve_forever()?;
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}
