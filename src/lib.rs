use env_logger::fmt::Color;
use log::{Level, LevelFilter};
use std::io::Write;
use structopt::StructOpt;

pub mod args;
pub mod cache;
pub mod http;
pub mod packet;
pub mod pool;
pub mod proxy;
pub mod relay;
pub mod stat;
pub mod tcp;
pub mod tunnel;
pub mod udp;

pub use relay::{Relay, RelayConfig, StopHandle};
pub use tunnel::Device;

/// Parses arguments and returns a `Flags`.
pub fn parse() -> args::Flags {
    args::Flags::from_args()
}

/// Sets the logger.
pub fn set_logger(flags: &args::Flags) {
    let level = match &flags.vverbose {
        true => LevelFilter::Trace,
        false => match flags.verbose {
            true => LevelFilter::Debug,
            false => LevelFilter::Info,
        },
    };
    env_logger::builder()
        .filter_level(level)
        .format(|buf, record| {
            let mut style = buf.style();

            let level = match &record.level() {
                Level::Error => style.set_bold(true).set_color(Color::Red).value("error: "),
                Level::Warn => style
                    .set_bold(true)
                    .set_color(Color::Yellow)
                    .value("warning: "),
                Level::Info => style.set_bold(true).set_color(Color::Green).value(""),
                _ => style.set_color(Color::Rgb(165, 165, 165)).value(""),
            };
            writeln!(buf, "{}{}", level, record.args())
        })
        .init();
}

/// Validates arguments and returns an `Opts`.
pub fn validate(flags: &args::Flags) -> Result<args::Opts, String> {
    args::Opts::validate(flags)
}
