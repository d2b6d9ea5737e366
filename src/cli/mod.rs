pub mod commands;

use docstore::DatabaseManager;
use serde_json::Value;

/// Parse a command-line value as JSON, falling back to a plain string
pub fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Warning for stores whose data does not outlive this process
pub fn embedded_store_warning(manager: &DatabaseManager) -> Option<String> {
    manager.is_embedded().then(|| {
        format!(
            "{} is an in-process store; its entries are gone when this command exits. \
             Pass --url bolt://host:7687/<database> to use a persistent store.",
            manager.url()
        )
    })
}
