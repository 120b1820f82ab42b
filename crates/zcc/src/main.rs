//! zcc CLI driver
//!
//! `zcc [-I<dir>]... [-E] [-o <file>] <input>` compiles one C source
//! file to x86-64 assembly on stdout (or the `-o` target). `-` denotes
//! stdin/stdout. Exit status is 0 on success and 1 on any error.

use std::path::PathBuf;
use std::process;

use clap::Parser as ClapParser;
use tracing_subscriber::EnvFilter;

#[derive(ClapParser)]
#[command(name = "zcc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "A small C compiler emitting x86-64 assembly", long_about = None)]
struct Cli {
    /// Input C source file ("-" reads standard input)
    input: String,

    /// Add DIR to the #include search path (may be repeated)
    #[arg(short = 'I', value_name = "DIR")]
    include: Vec<PathBuf>,

    /// Stop after preprocessing and print the expanded source
    #[arg(short = 'E')]
    preprocess_only: bool,

    /// Write output to FILE ("-" writes standard output)
    #[arg(short = 'o', value_name = "FILE", default_value = "-")]
    output: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("ZCC_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = if cli.preprocess_only {
        zcc::preprocess_file(&cli.input, cli.include)
    } else {
        zcc::compile_file(&cli.input, cli.include)
    };

    let text = match result {
        Ok(text) => text,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if cli.output == "-" {
        print!("{}", text);
    } else if let Err(e) = std::fs::write(&cli.output, &text) {
        eprintln!("cannot write {}: {}", cli.output, e);
        process::exit(1);
    }
}
