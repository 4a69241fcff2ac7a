use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use env_logger::{Builder, Env};

/// Keep a counter, a record and its history in a persistent object pool.
///
/// The first run creates the pool; every later run advances it by one step.
#[derive(Parser, Debug)]
#[command(name = "pobj-hello", version, about)]
struct Cli {
    /// Pool file to create or update
    pool: PathBuf,
}

fn main() -> ExitCode {
    Builder::from_env(Env::default().default_filter_or("warn"))
        .format_module_path(false)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version are not failures.
            return if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
        }
    };

    match pobj_hello::run(&cli.pool) {
        Ok(report) => {
            print!("{}", report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("pobj-hello: {}: {}", cli.pool.display(), e);
            ExitCode::FAILURE
        }
    }
}
