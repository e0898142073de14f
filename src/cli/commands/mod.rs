pub mod capture;
pub mod logging;
pub mod outbox;
pub mod risk;

use clap::{
    Arg, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub const ARG_CREDENTIALS_URL: &str = "credentials-url";
pub const ARG_EVALUATE_TOKEN: &str = "evaluate-token";

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("trustgate")
        .about("Context-aware sign-in risk engine")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("TRUSTGATE_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("Database connection string")
                .env("TRUSTGATE_DSN")
                .required(true),
        )
        .arg(
            Arg::new(ARG_CREDENTIALS_URL)
                .long(ARG_CREDENTIALS_URL)
                .help("Base URL of the credential verification service")
                .long_help(
                    "Base URL of the credential verification service.\n\nCredentials are POSTed to `{url}/verify`; 200 with `account_id` is a match, 401/404 a mismatch.",
                )
                .env("TRUSTGATE_CREDENTIALS_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_EVALUATE_TOKEN)
                .long(ARG_EVALUATE_TOKEN)
                .help("Bearer token required on /v1/auth/context/evaluate")
                .long_help(
                    "Bearer token required on /v1/auth/context/evaluate.\n\nWhen unset the endpoint refuses every call.",
                )
                .env("TRUSTGATE_EVALUATE_TOKEN")
                .hide_env_values(true),
        );

    let command = risk::with_args(command);
    let command = capture::with_args(command);
    let command = outbox::with_args(command);
    logging::with_args(command)
}
