// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error};

use crate::errors::SinkError;
use crate::record::LogRecord;
use crate::sink::Sink;

pub const DEFAULT_TABLE: &str = "logs";

#[derive(Debug, Clone)]
pub struct PostgresSinkConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: String,
    pub table: String,
}

impl PostgresSinkConfig {
    pub fn new(dbname: impl Into<String>) -> Self {
        Self {
            host: None,
            port: None,
            user: None,
            password: None,
            dbname: dbname.into(),
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

/// Stores records in a PostgreSQL table, creating it on first connect.
pub struct PostgresSink {
    config: PostgresSinkConfig,
    client: Option<Client>,
}

impl PostgresSink {
    pub fn new(config: PostgresSinkConfig) -> Result<Self, SinkError> {
        if config.table.is_empty() || config.table.contains('"') {
            return Err(SinkError::InvalidTable(config.table));
        }
        Ok(Self {
            config,
            client: None,
        })
    }

    fn table(&self) -> String {
        format!("\"{}\"", self.config.table)
    }

    fn create_statements(&self) -> String {
        let table = self.table();
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
             id SERIAL PRIMARY KEY, \
             level INT NOT NULL, \
             pid INT NOT NULL, \
             host VARCHAR, \
             message VARCHAR NOT NULL, \
             created_at TIMESTAMP NOT NULL, \
             created_by VARCHAR NOT NULL, \
             exception VARCHAR, \
             path VARCHAR, \
             lineno INT);"
        );
        for column in ["level", "host", "created_by"] {
            let index = format!("\"{}_{column}_idx\"", self.config.table);
            sql.push_str(&format!(
                "\nCREATE INDEX IF NOT EXISTS {index} ON {table} ({column});"
            ));
        }
        sql
    }

    fn insert_statement(&self) -> String {
        format!(
            "INSERT INTO {} (level, pid, host, message, created_at, created_by, exception, path, lineno) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            self.table()
        )
    }
}

impl fmt::Display for PostgresSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "postgres {}/{}", self.config.dbname, self.config.table)
    }
}

#[async_trait]
impl Sink for PostgresSink {
    async fn connect(&mut self) -> Result<(), SinkError> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(self.config.host.as_deref().unwrap_or("localhost"))
            .dbname(&self.config.dbname);
        if let Some(port) = self.config.port {
            config.port(port);
        }
        if let Some(user) = &self.config.user {
            config.user(user);
        }
        if let Some(password) = &self.config.password {
            config.password(password);
        }

        let (client, connection) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        debug!("Ensuring table {} exists", self.config.table);
        client.batch_execute(&self.create_statements()).await?;

        self.client = Some(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.as_ref().is_some_and(|client| !client.is_closed())
    }

    async fn send(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        let row = Row::from_record(record)?;
        let statement = self.insert_statement();
        let client = self.client.as_ref().ok_or(SinkError::NotConnected)?;

        let params: [&(dyn ToSql + Sync); 9] = [
            &row.level,
            &row.pid,
            &row.host,
            &row.message,
            &row.created_at,
            &row.created_by,
            &row.exception,
            &row.path,
            &row.lineno,
        ];
        client.execute(statement.as_str(), &params).await?;
        Ok(())
    }

    fn invalidate(&mut self) {
        self.client = None;
    }
}

/// Column values of one record.
#[derive(Debug, PartialEq)]
struct Row {
    level: i32,
    pid: i32,
    host: Option<String>,
    message: String,
    created_at: NaiveDateTime,
    created_by: String,
    exception: Option<String>,
    path: Option<String>,
    lineno: Option<i32>,
}

impl Row {
    fn from_record(record: &LogRecord) -> Result<Self, SinkError> {
        let required_str = |field: &str| {
            record
                .str_field(field)
                .map(str::to_string)
                .ok_or_else(|| SinkError::InvalidRecord(format!("{field} is not a string")))
        };
        let optional_str = |field: &str| record.str_field(field).map(str::to_string);

        let created_at = record
            .get("created_at")
            .and_then(parse_timestamp)
            .ok_or_else(|| SinkError::InvalidRecord("created_at is not a timestamp".to_string()))?;

        Ok(Self {
            level: int_column(record, "level")?
                .ok_or_else(|| SinkError::InvalidRecord("level is missing".to_string()))?,
            pid: int_column(record, "pid")?
                .ok_or_else(|| SinkError::InvalidRecord("pid is missing".to_string()))?,
            host: optional_str("host"),
            message: required_str("message")?,
            created_at,
            created_by: required_str("created_by")?,
            exception: optional_str("exception"),
            path: optional_str("path"),
            lineno: int_column(record, "lineno")?,
        })
    }
}

fn int_column(record: &LogRecord, field: &str) -> Result<Option<i32>, SinkError> {
    match record.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| SinkError::InvalidRecord(format!("{field} is not a 32 bit integer"))),
    }
}

/// Parses ISO-8601 strings (offsets are converted to UTC) and numeric UNIX epochs.
fn parse_timestamp(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let whole = secs.floor();
            let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
            DateTime::from_timestamp(whole as i64, nanos).map(|dt| dt.naive_utc())
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.naive_utc())
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
            .ok(),
        _ => None,
    }
}
