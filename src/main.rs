use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use docstore::config::Config;
use docstore::logging;
use docstore::DatabaseManager;
use dotenv::dotenv;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::warn;

mod cli;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenv().ok();

    let matches = build_cli().get_matches();

    if let Err(e) = run_command(matches).await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn build_cli() -> Command {
    Command::new("docstore")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Key-value store over a pooled document database")
        .arg_required_else_help(true)
        .arg(
            Arg::new("config-dir")
                .long("config-dir")
                .help("Directory containing config.toml")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true),
        )
        .arg(
            Arg::new("url")
                .long("url")
                .help(
                    "Store URL, e.g. bolt://localhost:7687/neo4j. memory: URLs (the default) \
                     are in-process and lose their entries when the command exits",
                )
                .global(true),
        )
        .arg(
            Arg::new("username")
                .short('u')
                .long("username")
                .help("Store username")
                .global(true),
        )
        .arg(
            Arg::new("password")
                .short('p')
                .long("password")
                .help("Store password")
                .global(true),
        )
        .subcommand(
            Command::new("get")
                .about("Print the value stored under a key")
                .arg(Arg::new("key").help("Entry key").required(true).index(1)),
        )
        .subcommand(
            Command::new("put")
                .about("Store a value under a key")
                .arg(Arg::new("key").help("Entry key").required(true).index(1))
                .arg(
                    Arg::new("value")
                        .help("JSON value; anything that is not valid JSON is stored as a string")
                        .required(true)
                        .index(2),
                ),
        )
        .subcommand(
            Command::new("put-all")
                .about("Store every entry of a JSON object in one call")
                .arg(
                    Arg::new("entries")
                        .help("JSON object mapping keys to values")
                        .required(true)
                        .index(1),
                ),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove the entry under a key")
                .arg(Arg::new("key").help("Entry key").required(true).index(1)),
        )
        .subcommand(
            Command::new("remove-all")
                .about("Remove the entries under several keys in one call")
                .arg(
                    Arg::new("keys")
                        .help("Entry keys")
                        .required(true)
                        .num_args(1..)
                        .index(1),
                ),
        )
        .subcommand(
            Command::new("status")
                .about("Show store connectivity and pool statistics")
                .arg(
                    Arg::new("verbose")
                        .short('v')
                        .long("verbose")
                        .help("Also print the effective configuration")
                        .action(ArgAction::SetTrue),
                ),
        )
}

fn load_config(matches: &clap::ArgMatches) -> anyhow::Result<Config> {
    let mut config = match matches.get_one::<PathBuf>("config-dir") {
        Some(dir) => Config::load_from_dir(dir)?,
        None => Config::load()?,
    };

    if let Some(url) = matches.get_one::<String>("url") {
        config.store.url = url.clone();
    }
    if let Some(username) = matches.get_one::<String>("username") {
        config.store.username = username.clone();
    }
    if let Some(password) = matches.get_one::<String>("password") {
        config.store.password = password.clone();
    }
    Ok(config)
}

async fn run_command(matches: clap::ArgMatches) -> anyhow::Result<()> {
    let config = load_config(&matches)?;
    logging::init_tracing(&config.logging)?;

    let manager = Arc::new(DatabaseManager::from_config(&config)?);
    manager
        .setup()
        .await
        .with_context(|| format!("Failed to set up store at {}", config.store.url))?;
    if let Some(warning) = cli::embedded_store_warning(&manager) {
        warn!("{}", warning);
    }

    let result = match matches.subcommand() {
        Some(("get", sub_matches)) => cli::commands::entries::handle_get(sub_matches, &manager).await,
        Some(("put", sub_matches)) => cli::commands::entries::handle_put(sub_matches, &manager).await,
        Some(("put-all", sub_matches)) => {
            cli::commands::entries::handle_put_all(sub_matches, &manager).await
        }
        Some(("remove", sub_matches)) => {
            cli::commands::entries::handle_remove(sub_matches, &manager).await
        }
        Some(("remove-all", sub_matches)) => {
            cli::commands::entries::handle_remove_all(sub_matches, &manager).await
        }
        Some(("status", sub_matches)) => {
            cli::commands::status::handle_status(sub_matches, &manager, &config).await
        }
        _ => Ok(()),
    };

    manager.shutdown().await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_global_overrides_parse() {
        let matches = build_cli()
            .try_get_matches_from(["docstore", "get", "alpha", "--url", "memory:cli"])
            .unwrap();
        assert_eq!(
            matches.get_one::<String>("url").map(String::as_str),
            Some("memory:cli")
        );
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "get");
        assert_eq!(sub.get_one::<String>("key").map(String::as_str), Some("alpha"));
    }
}
