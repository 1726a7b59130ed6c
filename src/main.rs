use anyhow::Result;
use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use snapdump::cancel::CancelToken;
use snapdump::cli::{Cli, Commands, ConnectionArgs};
use snapdump::config::connection::ConnectionParams;
use snapdump::drivers::TableFilters;
use snapdump::ops::{self, DumpOptions, RestoreOptions, RunOutcome};
use snapdump::storage;

const EXIT_FATAL: i32 = 2;

fn main() {
    match run() {
        Ok(outcome) => std::process::exit(outcome.exit_code()),
        Err(err) => {
            eprintln!("{} {:#}", "Error:".red().bold(), err);
            std::process::exit(EXIT_FATAL);
        }
    }
}

fn run() -> Result<RunOutcome> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cancel = CancelToken::new();
    cancel.install_signal_handler()?;

    match cli.command {
        Commands::Dump(args) => {
            let opts = DumpOptions {
                conn: connection_params(&args.conn)?,
                jobs: usize::from(args.conn.jobs),
                filters: TableFilters {
                    schemas: args.schemas,
                    exclude_schemas: args.exclude_schemas,
                    tables: args.tables,
                    exclude_tables: args.exclude_tables,
                },
                output: args.output.unwrap_or_else(storage::default_backup_dir),
            };
            ops::do_dump(opts, &cancel)
        }
        Commands::Restore(args) if args.info => {
            ops::do_info(args.input)?;
            Ok(RunOutcome::Completed)
        }
        Commands::Restore(args) => {
            let opts = RestoreOptions {
                conn: connection_params(&args.conn)?,
                jobs: usize::from(args.conn.jobs),
                input: args.input,
            };
            ops::do_restore(opts, &cancel)
        }
    }
}

fn connection_params(args: &ConnectionArgs) -> Result<ConnectionParams> {
    let password = if args.prompt_password {
        eprint!("{} ", "Password:".cyan().bold());
        Some(rpassword::read_password()?)
    } else {
        std::env::var("PGPASSWORD").ok()
    };
    Ok(ConnectionParams {
        dbname: args.dbname.clone(),
        host: args.host.clone(),
        port: args.port,
        user: args.username.clone(),
        password,
    })
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
