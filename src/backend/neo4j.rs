//! Remote engine over Neo4j (`bolt://` and `neo4j://` schemes)
//!
//! Schema classes map to node labels, and creating a class creates an index
//! on its `key` property. A document is a node whose fields are stored as
//! string properties next to a `<field>__type` tag; non-string values are
//! stored as JSON text. Every node carries a `version` property used for the
//! optimistic check on update.
//!
//! Each pooled session owns a `Graph` capped at one bolt connection, so the
//! session pool size bounds the connections held against the server.

use async_trait::async_trait;
use neo4rs::{query, ConfigBuilder, Graph, Node, Query, Row, Txn};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::client::{
    Connection, Credentials, DocumentConnection, Engine, ObjectConnection, StoreUrl,
};
use crate::document::{Document, Field, FieldType, RecordId};
use crate::error::DbError;
use crate::query::{is_identifier, Operator, Param, Predicate, Statement, StatementKind};

const DEFAULT_DATABASE: &str = "neo4j";
const DEFAULT_FETCH_SIZE: usize = 500;
const TYPE_SUFFIX: &str = "__type";
const VERSION_PROPERTY: &str = "version";

/// Engine for remote Neo4j servers
#[derive(Debug, Clone)]
pub struct Neo4jEngine {
    fetch_size: usize,
    entity_classes: Arc<RwLock<HashSet<String>>>,
}

impl Neo4jEngine {
    pub fn new() -> Self {
        Self {
            fetch_size: DEFAULT_FETCH_SIZE,
            entity_classes: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Set fetch size for query results
    pub fn with_fetch_size(mut self, size: usize) -> Self {
        self.fetch_size = size;
        self
    }

    /// Split `host:port/database` into a server URI and a database name
    fn target(url: &StoreUrl) -> (String, String) {
        let (host, database) = match url.path().split_once('/') {
            Some((host, db)) if !db.is_empty() => (host, db),
            Some((host, _)) => (host, DEFAULT_DATABASE),
            None => (url.path(), DEFAULT_DATABASE),
        };
        (format!("{}://{}", url.scheme(), host), database.to_string())
    }

    async fn connect(&self, url: &StoreUrl, credentials: &Credentials) -> Result<Graph, DbError> {
        let (uri, database) = Self::target(url);
        debug!("Connecting to Neo4j at {} (database {})", uri, database);

        let config = ConfigBuilder::default()
            .uri(&uri)
            .user(credentials.username())
            .password(credentials.password())
            .db(&*database)
            .fetch_size(self.fetch_size)
            .max_connections(1)
            .build()?;

        let unreachable = |e: neo4rs::Error| {
            error!("Failed to create Neo4j connection: {}", e);
            DbError::Unreachable(format!("{}: {}", uri, e))
        };
        // Graph::connect opens its bolt connection lazily
        let graph = Graph::connect(config).await.map_err(unreachable)?;
        graph.run(query("RETURN 1")).await.map_err(unreachable)?;
        Ok(graph)
    }

    fn session(&self, graph: Graph) -> Neo4jSession {
        Neo4jSession {
            graph,
            txn: None,
            entity_classes: Arc::clone(&self.entity_classes),
        }
    }
}

impl Default for Neo4jEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for Neo4jEngine {
    fn name(&self) -> &'static str {
        "neo4j"
    }

    fn schemes(&self) -> &[&'static str] {
        &["bolt", "neo4j"]
    }

    fn is_embedded(&self) -> bool {
        false
    }

    async fn exists(&self, url: &StoreUrl, credentials: &Credentials) -> Result<bool, DbError> {
        let graph = self.connect(url, credentials).await?;
        match graph.run(query("RETURN 1")).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Neo4j database check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn create(&self, url: &StoreUrl, _credentials: &Credentials) -> Result<(), DbError> {
        Err(DbError::Backend(format!(
            "remote database {} must be provisioned on the server",
            url
        )))
    }

    async fn open_document(
        &self,
        url: &StoreUrl,
        credentials: &Credentials,
    ) -> Result<Box<dyn DocumentConnection>, DbError> {
        let graph = self.connect(url, credentials).await?;
        Ok(Box::new(self.session(graph)))
    }

    async fn open_object(
        &self,
        url: &StoreUrl,
        credentials: &Credentials,
    ) -> Result<Box<dyn ObjectConnection>, DbError> {
        let graph = self.connect(url, credentials).await?;
        Ok(Box::new(self.session(graph)))
    }
}

/// Map server error codes onto the conditions the pool distinguishes
fn classify(err: neo4rs::Error, statement: &str) -> DbError {
    let message = err.to_string();
    if message.contains("Neo.ClientError.Statement.SyntaxError") {
        return DbError::query_parsing(statement, message);
    }
    if message.contains("Neo.TransientError.Transaction.DeadlockDetected")
        || message.contains("Neo.TransientError.Transaction.Outdated")
        || message.contains("Neo.TransientError.Transaction.LockClientStopped")
    {
        return DbError::ConcurrentModification {
            class: String::new(),
            record: message,
            expected: 0,
            actual: 0,
        };
    }
    DbError::Neo4j(err)
}

fn index_name(class: &str) -> String {
    format!("docstore_{}_key", class)
}

fn check_identifier(name: &str) -> Result<(), DbError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(DbError::Backend(format!("`{}` is not a valid identifier", name)))
    }
}

fn match_clause(statement: &Statement) -> String {
    let mut cypher = format!("MATCH (d:`{}`)", statement.class);
    if let Some(filter) = &statement.filter {
        let op = match filter.op {
            Operator::Eq => "=",
            Operator::In => "IN",
        };
        cypher.push_str(&format!(" WHERE d.`{}` {} $p0", filter.field, op));
    }
    cypher
}

fn bind(mut q: Query, predicate: Option<Predicate>) -> Query {
    match predicate {
        Some(Predicate::Equals { value, .. }) => q = q.param("p0", value),
        Some(Predicate::AnyOf { values, .. }) => q = q.param("p0", values),
        None => {}
    }
    q
}

/// `SET` assignments for every field of a document, with their parameters
fn assignments(document: &Document) -> Result<(Vec<String>, Vec<(String, String)>), DbError> {
    let mut sets = Vec::new();
    let mut params = Vec::new();
    for (i, (name, field)) in document.fields().enumerate() {
        check_identifier(name)?;
        let raw = match field.value() {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other)?,
        };
        sets.push(format!("d.`{}` = $f{}", name, i));
        sets.push(format!("d.`{}{}` = $t{}", name, TYPE_SUFFIX, i));
        params.push((format!("f{}", i), raw));
        params.push((format!("t{}", i), field.field_type().as_str().to_string()));
    }
    Ok((sets, params))
}

fn decode(class: &str, row: &Row) -> Result<Document, DbError> {
    let node: Node = row
        .get("d")
        .map_err(|e| DbError::Backend(format!("missing node in result: {}", e)))?;
    let rid: String = row
        .get("rid")
        .map_err(|e| DbError::Backend(format!("missing record id in result: {}", e)))?;
    let version: i64 = node.get(VERSION_PROPERTY).unwrap_or(0);

    let mut fields = BTreeMap::new();
    for key in node.keys() {
        if key == VERSION_PROPERTY || key.ends_with(TYPE_SUFFIX) {
            continue;
        }
        let ty = node
            .get::<String>(&format!("{}{}", key, TYPE_SUFFIX))
            .ok()
            .and_then(|t| FieldType::parse(&t))
            .unwrap_or(FieldType::String);
        let raw: String = node
            .get(key)
            .map_err(|e| DbError::Backend(format!("unreadable property {}: {}", key, e)))?;
        let value = match ty {
            FieldType::String => Value::String(raw),
            _ => serde_json::from_str(&raw)?,
        };
        fields.insert(key.to_string(), Field::with_type(ty, value)?);
    }

    Ok(Document::from_record(
        class,
        RecordId::new(rid),
        u64::try_from(version).unwrap_or(0),
        fields,
    ))
}

/// A session on a Neo4j server
struct Neo4jSession {
    graph: Graph,
    txn: Option<Txn>,
    entity_classes: Arc<RwLock<HashSet<String>>>,
}

impl Neo4jSession {
    async fn fetch(&mut self, q: Query) -> Result<Vec<Row>, neo4rs::Error> {
        let mut rows = Vec::new();
        match self.txn.as_mut() {
            Some(txn) => {
                let mut stream = txn.execute(q).await?;
                while let Some(row) = stream.next(txn.handle()).await? {
                    rows.push(row);
                }
            }
            None => {
                let mut stream = self.graph.execute(q).await?;
                while let Some(row) = stream.next().await? {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl Connection for Neo4jSession {
    async fn ping(&mut self) -> Result<(), DbError> {
        self.graph
            .run(query("RETURN 1 as health"))
            .await
            .map_err(|e| DbError::Unreachable(e.to_string()))
    }

    async fn class_exists(&mut self, class: &str) -> Result<bool, DbError> {
        let cypher = "SHOW INDEXES YIELD name WHERE name = $name RETURN count(*) AS n";
        let rows = self
            .fetch(query(cypher).param("name", index_name(class)))
            .await
            .map_err(|e| classify(e, cypher))?;
        let count: i64 = rows.first().and_then(|row| row.get("n").ok()).unwrap_or(0);
        Ok(count > 0)
    }

    async fn create_class(&mut self, class: &str) -> Result<(), DbError> {
        check_identifier(class)?;
        let cypher = format!(
            "CREATE INDEX `{}` IF NOT EXISTS FOR (d:`{}`) ON (d.key)",
            index_name(class),
            class
        );
        self.graph
            .run(query(&cypher))
            .await
            .map_err(|e| classify(e, &cypher))
    }

    async fn query(&mut self, sql: &str, params: &[Param]) -> Result<Vec<Document>, DbError> {
        let statement = Statement::parse(sql)?;
        if statement.kind == StatementKind::Delete {
            return Err(DbError::query_parsing(sql, "query expects a SELECT statement"));
        }
        let predicate = statement.bind(sql, params)?;

        let mut cypher = format!("{} RETURN d, elementId(d) AS rid", match_clause(&statement));
        if let Some(limit) = statement.limit() {
            cypher.push_str(&format!(" LIMIT {}", limit));
        }

        let rows = self
            .fetch(bind(query(&cypher), predicate))
            .await
            .map_err(|e| classify(e, sql))?;
        rows.iter().map(|row| decode(&statement.class, row)).collect()
    }

    async fn command(&mut self, sql: &str, params: &[Param]) -> Result<u64, DbError> {
        let statement = Statement::parse(sql)?;
        if statement.kind != StatementKind::Delete {
            return Err(DbError::query_parsing(sql, "command expects a DELETE statement"));
        }
        let predicate = statement.bind(sql, params)?;

        let cypher = format!(
            "{} WITH collect(d) AS docs FOREACH (n IN docs | DETACH DELETE n) RETURN size(docs) AS removed",
            match_clause(&statement)
        );
        let rows = self
            .fetch(bind(query(&cypher), predicate))
            .await
            .map_err(|e| classify(e, sql))?;
        let removed: i64 = rows
            .first()
            .and_then(|row| row.get("removed").ok())
            .unwrap_or(0);
        Ok(u64::try_from(removed).unwrap_or(0))
    }

    async fn save(&mut self, document: &mut Document) -> Result<(), DbError> {
        check_identifier(document.class())?;
        let (mut sets, params) = assignments(document)?;

        let cypher = match document.rid() {
            None => {
                sets.push(format!("d.{} = 1", VERSION_PROPERTY));
                format!(
                    "CREATE (d:`{}`) SET {} RETURN elementId(d) AS rid, d.{} AS version",
                    document.class(),
                    sets.join(", "),
                    VERSION_PROPERTY
                )
            }
            Some(_) => {
                sets.push(format!("d.{0} = d.{0} + 1", VERSION_PROPERTY));
                format!(
                    "MATCH (d:`{}`) WHERE elementId(d) = $rid AND d.{} = $version SET {} \
                     RETURN elementId(d) AS rid, d.{} AS version",
                    document.class(),
                    VERSION_PROPERTY,
                    sets.join(", "),
                    VERSION_PROPERTY
                )
            }
        };

        let mut q = query(&cypher);
        for (name, value) in params {
            q = q.param(&name, value);
        }
        if let Some(rid) = document.rid() {
            q = q
                .param("rid", rid.as_str().to_string())
                .param("version", document.version() as i64);
        }

        let rows = self.fetch(q).await.map_err(|e| classify(e, &cypher))?;
        let Some(row) = rows.first() else {
            // Matched nothing: the record moved on or was deleted under us
            return Err(DbError::ConcurrentModification {
                class: document.class().to_string(),
                record: document.rid().map(ToString::to_string).unwrap_or_default(),
                expected: document.version(),
                actual: 0,
            });
        };

        let rid: String = row
            .get("rid")
            .map_err(|e| DbError::Backend(format!("missing record id: {}", e)))?;
        let version: i64 = row
            .get("version")
            .map_err(|e| DbError::Backend(format!("missing version: {}", e)))?;
        document.assign(RecordId::new(rid), u64::try_from(version).unwrap_or(0));
        Ok(())
    }

    fn release(&mut self) {
        if let Some(txn) = self.txn.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = txn.rollback().await {
                            warn!("Rollback of abandoned transaction failed: {}", e);
                        }
                    });
                }
                Err(_) => warn!("Dropping open Neo4j transaction outside a runtime"),
            }
        }
    }
}

#[async_trait]
impl DocumentConnection for Neo4jSession {
    async fn begin(&mut self) -> Result<(), DbError> {
        if self.txn.is_some() {
            return Err(DbError::Backend("transaction already active".to_string()));
        }
        self.txn = Some(self.graph.start_txn().await?);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| DbError::Backend("no active transaction".to_string()))?;
        txn.commit().await.map_err(|e| classify(e, "COMMIT"))
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        match self.txn.take() {
            Some(txn) => txn.rollback().await.map_err(DbError::from),
            None => Ok(()),
        }
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }
}

#[async_trait]
impl ObjectConnection for Neo4jSession {
    async fn register_entity_class(&mut self, class: &str) -> Result<(), DbError> {
        check_identifier(class)?;
        self.entity_classes.write().insert(class.to_string());
        Ok(())
    }

    fn is_registered(&self, class: &str) -> bool {
        self.entity_classes.read().contains(class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_target_defaults_database() {
        let url = StoreUrl::parse("bolt://localhost:7687").unwrap();
        assert_eq!(
            Neo4jEngine::target(&url),
            ("bolt://localhost:7687".to_string(), "neo4j".to_string())
        );

        let url = StoreUrl::parse("neo4j://db.internal:7687/orders").unwrap();
        assert_eq!(
            Neo4jEngine::target(&url),
            ("neo4j://db.internal:7687".to_string(), "orders".to_string())
        );
    }

    #[test]
    fn test_match_clause_translation() {
        let stmt = Statement::parse("SELECT FROM keyValue WHERE key = ? LIMIT 1").unwrap();
        assert_eq!(match_clause(&stmt), "MATCH (d:`keyValue`) WHERE d.`key` = $p0");

        let stmt = Statement::parse("DELETE FROM keyValue WHERE key IN ?").unwrap();
        assert_eq!(match_clause(&stmt), "MATCH (d:`keyValue`) WHERE d.`key` IN $p0");
    }

    #[test]
    fn test_assignments_tag_types() {
        let mut doc = Document::new("keyValue");
        doc.set_field("key", json!("a"));
        doc.set_field("value", json!({"n": 1}));

        let (sets, params) = assignments(&doc).unwrap();
        assert_eq!(sets.len(), 4);
        assert!(params.contains(&("f0".to_string(), "a".to_string())));
        assert!(params.contains(&("t0".to_string(), "string".to_string())));
        assert!(params.contains(&("f1".to_string(), r#"{"n":1}"#.to_string())));
        assert!(params.contains(&("t1".to_string(), "embedded".to_string())));
    }

    #[test]
    fn test_assignments_reject_unsafe_names() {
        let mut doc = Document::new("keyValue");
        doc.set_field("bad name", json!(1));
        assert!(assignments(&doc).is_err());
    }

    #[tokio::test]
    async fn test_open_reports_unreachable_server() {
        let engine = Neo4jEngine::new();
        let url = StoreUrl::parse("bolt://127.0.0.1:1/neo4j").unwrap();
        let creds = Credentials::new("neo4j", "password");

        match engine.open_document(&url, &creds).await {
            Err(DbError::Unreachable(msg)) => assert!(msg.contains("127.0.0.1:1")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[tokio::test]
    #[ignore] // Only run with --ignored when Neo4j is available
    async fn test_session_with_real_neo4j() {
        let Ok(uri) = std::env::var("NEO4J_URI") else {
            return;
        };
        let user = std::env::var("NEO4J_USER").unwrap_or_else(|_| "neo4j".to_string());
        let password = std::env::var("NEO4J_PASSWORD").unwrap_or_else(|_| "password".to_string());

        let engine = Neo4jEngine::new();
        let url = StoreUrl::parse(&uri).unwrap();
        let creds = Credentials::new(user, password);

        let mut session = engine.open_document(&url, &creds).await.unwrap();
        session.ping().await.unwrap();
        if !session.class_exists("docstoreTest").await.unwrap() {
            session.create_class("docstoreTest").await.unwrap();
        }

        let mut doc = Document::new("docstoreTest");
        doc.set_field("key", json!("ping"));
        doc.set_field("value", json!([1, 2, 3]));
        session.save(&mut doc).await.unwrap();

        let found = session
            .query("SELECT FROM docstoreTest WHERE key = ? LIMIT 1", &[Param::from("ping")])
            .await
            .unwrap();
        assert_eq!(found[0].value("value"), Some(&json!([1, 2, 3])));

        session
            .command("DELETE FROM docstoreTest WHERE key = ?", &[Param::from("ping")])
            .await
            .unwrap();
    }
}
