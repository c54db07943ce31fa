// SPDX-License-Identifier: Apache-2.0

//! Simple BigQuery client built on Apache Arrow.
//!
//! Query results come back as one Arrow [`RecordBatch`](arrow::array::RecordBatch),
//! and record batches can be written into tables, with nulls kept as nulls in
//! both directions.
//!
//! # Architecture
//!
//! ```text
//! BqLite (read_table / write_table / create_table / delete_table / read_to_table)
//!   ↓
//! CredentialResolver → Credentials (explicit > key file > ambient)
//!   ↓
//! Connector → WarehouseService (BigQuery v2 REST)
//!   ↓
//! QueryCursor pages → ResultMaterializer → RecordBatch
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bqlite::{BqConfig, BqLite, CredentialConfig, FieldType, TableSchema};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BqConfig {
//!         credentials: CredentialConfig::key_file("/path/to/key.json"),
//!         ..Default::default()
//!     };
//!     let client = BqLite::new(config)?;
//!
//!     let schema = TableSchema::from_pairs([("id", FieldType::Integer), ("name", FieldType::String)]);
//!     client.create_table(&schema, "my-project", "my_dataset", "people").await?;
//!
//!     let batch = client.read_table("SELECT id, name FROM my_dataset.people", "my-project").await?;
//!     println!("Read {} rows", batch.num_rows());
//!
//!     Ok(())
//! }
//! ```

pub use auth::{CredentialResolver, CredentialSource, Credentials, TokenProvider};
pub use client::rest::HttpConnector;
pub use client::{Connector, JobState, WarehouseService};
pub use config::{
    AmbientCredentials, ApiConfig, BqConfig, CredentialConfig, QueryOptions, WriteDisposition,
};
pub use error::{BqError, BqResult, RowInsertError};
pub use materializer::{materialize, ResultMaterializer};
pub use provider::{BqLite, ReadToTableOptions};
pub use types::{FieldMode, FieldSchema, FieldType, TableSchema};
pub use value::{Record, RowBatch, Value};

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod materializer;
pub mod provider;
pub mod types;
pub mod value;
