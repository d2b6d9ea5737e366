use anyhow::Result;
use clap::ArgMatches;
use std::sync::Arc;

use docstore::config::Config;
use docstore::db::PoolStats;
use docstore::DatabaseManager;

pub async fn handle_status(
    matches: &ArgMatches,
    manager: &Arc<DatabaseManager>,
    config: &Config,
) -> Result<()> {
    let verbose = matches.get_flag("verbose");

    println!("Store: {}", manager.url());
    println!("Collection: {}", manager.collection());
    println!("State: {}", manager.lifecycle_state());

    if manager.health_check().await {
        println!("Health: ok");
    } else {
        println!("Health: unreachable");
    }

    if let Some(stats) = manager.pool_stats() {
        print_pool("object", &stats.object);
        print_pool("document", &stats.document);
    }

    if verbose {
        println!("\nEngines: {}", manager.registry().schemes().join(", "));
        println!(
            "Pool timeouts: connect {}s, idle {}s, lifetime {}s",
            config.pool.connection_timeout_secs,
            config.pool.idle_timeout_secs,
            config.pool.max_lifetime_secs
        );
        if !config.store.object_classes.is_empty() {
            println!("Object classes: {}", config.store.object_classes.join(", "));
        }
        println!("Log level: {} ({})", config.logging.level, config.logging.format);
    }

    Ok(())
}

fn print_pool(mode: &str, stats: &PoolStats) {
    println!(
        "Pool {}: {} sessions ({} idle, {} active), size {}..{}",
        mode,
        stats.size,
        stats.idle_connections,
        stats.active_connections,
        stats.min_size,
        stats.max_size
    );
}
