//! skvctl - command-line access to a session store instance.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use skv_session::{InstanceName, InstanceResolver, SessionConfig, SessionStore};

/// Create, read, and delete sessions on a configured instance.
#[derive(Parser)]
#[command(name = "skvctl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "SKV_CONFIG")]
    config: PathBuf,

    /// Project of the target instance
    #[arg(long)]
    project: String,

    /// Location of the target instance
    #[arg(long)]
    location: String,

    /// Instance id of the target instance
    #[arg(long)]
    instance: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a session for a user and print its id
    Create { user_id: String },
    /// Print the user id of a session
    Get { session_id: String },
    /// Delete a session
    Delete { session_id: String },
    /// Set a session attribute
    AttrSet {
        session_id: String,
        key: String,
        value: String,
    },
    /// Print a session attribute
    AttrGet { session_id: String, key: String },
    /// Delete every attribute of a session
    AttrClear { session_id: String },
    /// Authenticate and ping the instance
    Ping,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("skvctl failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = SessionConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.security.validate().context("checking transport security")?;

    let name = InstanceName::new(cli.project, cli.location, cli.instance);
    let instance = config.resolver().resolve(&name)?;
    let store = SessionStore::from_config(&config);

    let result = execute(&store, &instance, cli.command);
    store.cache().close_all();
    result
}

fn execute(
    store: &SessionStore,
    instance: &skv_session::InstanceDescriptor,
    command: Command,
) -> Result<()> {
    match command {
        Command::Create { user_id } => {
            let session_id = store.create_session(instance, &user_id)?;
            println!("{session_id}");
        }
        Command::Get { session_id } => {
            match store.get_user_id_from_session(instance, &session_id)? {
                Some(user_id) => println!("{user_id}"),
                None => println!("(no session)"),
            }
        }
        Command::Delete { session_id } => {
            store.delete_session(instance, &session_id)?;
        }
        Command::AttrSet {
            session_id,
            key,
            value,
        } => {
            store.set_session_attribute(instance, &session_id, &key, &value)?;
        }
        Command::AttrGet { session_id, key } => {
            match store.get_session_attribute(instance, &session_id, &key)? {
                Some(value) => println!("{value}"),
                None => println!("(no attribute)"),
            }
        }
        Command::AttrClear { session_id } => {
            let removed = store.delete_session_attributes(instance, &session_id)?;
            println!("{removed}");
        }
        Command::Ping => {
            println!("{}", store.ping(instance)?);
        }
    }
    Ok(())
}
