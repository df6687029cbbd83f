pub mod args;

pub use args::{Arguments, ClusterKind, Command};

use clap::Parser;

pub fn parse() -> Arguments {
    Arguments::parse()
}
