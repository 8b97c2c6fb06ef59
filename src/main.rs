use clap::{CommandFactory, Parser};
use cpulimit::cancel::{self, CancellationToken};
use cpulimit::cli::Cli;
use cpulimit::config::cpu_count;
use cpulimit::procfs::{ProcfsProvider, DEFAULT_PID_MAX};
use cpulimit::supervisor;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber; --verbose shows info-level diagnostics
fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let args = Cli::parse();
    init_tracing(args.verbose);

    let ncpu = cpu_count();
    let pid_max = ProcfsProvider::new().pid_max().unwrap_or(DEFAULT_PID_MAX);

    let config = match args.into_config(ncpu, pid_max) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("{}", Cli::command().render_usage());
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    if let Err(e) = cancel::install_signal_handler(&cancel) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    if config.verbose {
        println!("{} cpu detected", ncpu);
    }

    match supervisor::run(config, cancel) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            let code = e
                .downcast_ref::<supervisor::CommandError>()
                .map_or(1, supervisor::CommandError::exit_code);
            std::process::exit(code);
        }
    }
}
