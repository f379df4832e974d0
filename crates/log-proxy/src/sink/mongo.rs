// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, to_document, Document};
use mongodb::options::{ClientOptions, Credential, ServerAddress};
use mongodb::{Client, Collection};
use tracing::debug;

use crate::errors::SinkError;
use crate::record::LogRecord;
use crate::sink::Sink;

pub const DEFAULT_COLLECTION: &str = "logs";

/// How long a connect waits for a reachable server.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct MongoSinkConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: String,
    pub collection: String,
    pub timeout: Duration,
}

impl MongoSinkConfig {
    pub fn new(dbname: impl Into<String>) -> Self {
        Self {
            host: None,
            port: None,
            user: None,
            password: None,
            dbname: dbname.into(),
            collection: DEFAULT_COLLECTION.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Stores every record as one document of a MongoDB collection.
pub struct MongoSink {
    config: MongoSinkConfig,
    collection: Option<Collection<Document>>,
}

impl MongoSink {
    pub fn new(config: MongoSinkConfig) -> Result<Self, SinkError> {
        if config.collection.is_empty() || config.collection.contains(['$', '\0']) {
            return Err(SinkError::InvalidTable(config.collection));
        }
        Ok(Self {
            config,
            collection: None,
        })
    }

    fn client_options(&self) -> ClientOptions {
        let address = ServerAddress::Tcp {
            host: self
                .config
                .host
                .clone()
                .unwrap_or_else(|| "localhost".to_string()),
            port: self.config.port,
        };
        let credential = self.config.user.as_ref().map(|user| {
            Credential::builder()
                .username(user.clone())
                .password(self.config.password.clone())
                .build()
        });

        ClientOptions::builder()
            .hosts(vec![address])
            .credential(credential)
            .server_selection_timeout(Some(self.config.timeout))
            .build()
    }
}

impl fmt::Display for MongoSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mongodb {}/{}", self.config.dbname, self.config.collection)
    }
}

#[async_trait]
impl Sink for MongoSink {
    async fn connect(&mut self) -> Result<(), SinkError> {
        let client = Client::with_options(self.client_options())?;
        let database = client.database(&self.config.dbname);

        // The client connects lazily, a ping makes an unreachable server fail here
        database.run_command(doc! { "ping": 1 }).await?;
        debug!("Using collection {}", self.config.collection);

        self.collection = Some(database.collection(&self.config.collection));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.collection.is_some()
    }

    async fn send(&mut self, record: &LogRecord) -> Result<(), SinkError> {
        let collection = self.collection.as_ref().ok_or(SinkError::NotConnected)?;
        collection.insert_one(document(record)?).await?;
        Ok(())
    }

    fn invalidate(&mut self) {
        self.collection = None;
    }
}

/// Converts a record into a BSON document, keeping every field.
fn document(record: &LogRecord) -> Result<Document, SinkError> {
    to_document(record).map_err(|e| SinkError::InvalidRecord(e.to_string()))
}
