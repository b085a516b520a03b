use std::ffi::OsStr;

use argp::{FromArgValue, FromArgs};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub mod cmd;
pub mod util;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromArgValue for LogLevel {
    fn from_arg_value(value: &OsStr) -> Result<Self, String> {
        match value.to_str() {
            Some("error") => Ok(Self::Error),
            Some("warn") => Ok(Self::Warn),
            Some("info") => Ok(Self::Info),
            Some("debug") => Ok(Self::Debug),
            Some("trace") => Ok(Self::Trace),
            _ => Err("Invalid log level".to_string()),
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(FromArgs, PartialEq, Debug)]
/// Converts relocatable PowerPC ELF objects into GameCube/Wii REL modules.
struct TopLevel {
    #[argp(subcommand)]
    command: SubCommand,
    #[argp(option, short = 'L')]
    /// Minimum logging level. (Default: info)
    /// Possible values: error, warn, info, debug, trace
    log_level: Option<LogLevel>,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand)]
enum SubCommand {
    Info(cmd::info::Args),
    Make(cmd::make::Args),
}

fn main() {
    let args: TopLevel = argp::parse_args_or_exit(argp::DEFAULT);
    let format = tracing_subscriber::fmt::format().with_target(false).without_time();
    let builder = tracing_subscriber::fmt().event_format(format);
    if let Some(level) = args.log_level {
        builder.with_max_level(LevelFilter::from(level)).init();
    } else {
        builder
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .init();
    }

    let result = match args.command {
        SubCommand::Info(c_args) => cmd::info::run(c_args),
        SubCommand::Make(c_args) => cmd::make::run(c_args),
    };
    if let Err(e) = result {
        eprintln!("Failed: {e:?}");
        std::process::exit(1);
    }
}
