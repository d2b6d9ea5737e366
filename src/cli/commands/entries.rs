use anyhow::{bail, Context, Result};
use clap::ArgMatches;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use docstore::{DatabaseManager, DocumentStore, KeyValueStore};

use crate::cli::parse_value;

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str> {
    matches
        .get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("missing argument <{}>", name))
}

pub async fn handle_get(matches: &ArgMatches, manager: &Arc<DatabaseManager>) -> Result<()> {
    let key = required(matches, "key")?;
    let store = DocumentStore::new(Arc::clone(manager));

    match store.get(key).await? {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => bail!("no entry for key `{}`", key),
    }
    Ok(())
}

pub async fn handle_put(matches: &ArgMatches, manager: &Arc<DatabaseManager>) -> Result<()> {
    let key = required(matches, "key")?;
    let value = parse_value(required(matches, "value")?);
    let store = DocumentStore::new(Arc::clone(manager));

    store.put(key, value).await?;
    println!("Stored `{}`", key);
    Ok(())
}

pub async fn handle_put_all(matches: &ArgMatches, manager: &Arc<DatabaseManager>) -> Result<()> {
    let raw = required(matches, "entries")?;
    let entries: HashMap<String, Value> =
        serde_json::from_str(raw).context("entries must be a JSON object")?;
    let count = entries.len();
    let store = DocumentStore::new(Arc::clone(manager));

    store.put_all(entries).await?;
    println!("Stored {} entries", count);
    Ok(())
}

pub async fn handle_remove(matches: &ArgMatches, manager: &Arc<DatabaseManager>) -> Result<()> {
    let key = required(matches, "key")?;
    let store = DocumentStore::new(Arc::clone(manager));

    store.remove(key).await?;
    println!("Removed `{}`", key);
    Ok(())
}

pub async fn handle_remove_all(matches: &ArgMatches, manager: &Arc<DatabaseManager>) -> Result<()> {
    let keys: HashSet<String> = matches
        .get_many::<String>("keys")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    let store = DocumentStore::new(Arc::clone(manager));

    store.remove_all(&keys).await?;
    println!("Removed {} keys", keys.len());
    Ok(())
}
