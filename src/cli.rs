use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

/// snapdump: snapshot-consistent parallel binary backup and restore of PostgreSQL table data
#[derive(Parser, Debug)]
#[command(name = "snapdump", version, about = "Consistent parallel backup and restore of PostgreSQL table data.", long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Back up a database into a directory of per-table binary artifacts
    #[command(disable_help_flag = true)]
    Dump(DumpArgs),

    /// Restore a backup directory into a database
    #[command(disable_help_flag = true)]
    Restore(RestoreArgs),
}

/// Connection flags shared by both modes. `-h` is the host, as in the
/// PostgreSQL client tools, so help lives on `--help` only.
#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Database to connect to
    #[arg(short = 'd', long = "dbname", env = "PGDATABASE")]
    pub dbname: Option<String>,
    /// Database server host or socket directory
    #[arg(short = 'h', long = "host", env = "PGHOST")]
    pub host: Option<String>,
    /// Database server port
    #[arg(short = 'p', long = "port", env = "PGPORT")]
    pub port: Option<u16>,
    /// Database user name
    #[arg(short = 'U', long = "username", env = "PGUSER")]
    pub username: Option<String>,
    /// Prompt for a password before connecting
    #[arg(short = 'W', long = "password")]
    pub prompt_password: bool,
    /// Number of parallel workers
    #[arg(short = 'j', long = "jobs", default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub jobs: u16,
    /// Print help
    #[arg(long = "help", action = ArgAction::Help)]
    pub help: Option<bool>,
}

#[derive(Args, Debug)]
pub struct DumpArgs {
    #[command(flatten)]
    pub conn: ConnectionArgs,
    /// Dump only schemas matching this pattern (repeatable)
    #[arg(short = 'n', long = "schema")]
    pub schemas: Vec<String>,
    /// Do not dump schemas matching this pattern (repeatable)
    #[arg(short = 'N', long = "exclude-schema")]
    pub exclude_schemas: Vec<String>,
    /// Dump only tables matching this pattern (repeatable)
    #[arg(short = 't', long = "table")]
    pub tables: Vec<String>,
    /// Do not dump tables matching this pattern (repeatable)
    #[arg(short = 'T', long = "exclude-table")]
    pub exclude_tables: Vec<String>,
    /// Backup directory to create (defaults to binary_bkup_<timestamp>)
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    #[command(flatten)]
    pub conn: ConnectionArgs,
    /// Only print the backup's metadata
    #[arg(short = 'i', long = "info")]
    pub info: bool,
    /// Backup directory to restore from
    pub input: PathBuf,
}
