#![doc = include_str!(concat!(env!("OUT_DIR"), "/README.md"))]

/// CLI module - command-line interface for the sync engine
mod cli;

fn main() {
    cli::run_cli();
}
