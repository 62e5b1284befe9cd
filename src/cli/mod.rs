pub mod args;

use clap::Parser;

pub use args::Arguments;

pub fn parse() -> Arguments {
    Arguments::parse()
}
