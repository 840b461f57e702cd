pub mod args;

use clap::Parser;
pub use args::{Arguments, MonitorDevice};

pub fn parse() -> Arguments {
    Arguments::parse()
}
