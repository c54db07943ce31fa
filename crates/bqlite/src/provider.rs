// SPDX-License-Identifier: Apache-2.0

//! Caller-facing BigQuery operations

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arrow::array::RecordBatch;
use async_once_cell::OnceCell;
use tracing::{debug, info, warn};

use crate::auth::{CredentialResolver, Credentials};
use crate::client::rest::HttpConnector;
use crate::client::{
    wait_for_job, Connector, JobState, QueryCursor, QueryJob, QueryRequest, TableReference,
    WarehouseService,
};
use crate::codec::encode_batch;
use crate::config::{BqConfig, QueryOptions, WriteDisposition};
use crate::error::{BqError, BqResult, RowInsertError};
use crate::materializer::ResultMaterializer;
use crate::types::TableSchema;

/// Rows sent per insertAll request
const INSERT_CHUNK_ROWS: usize = 500;

/// Options for [`BqLite::read_to_table`]
#[derive(Debug, Clone, Default)]
pub struct ReadToTableOptions {
    /// What to do with existing rows of the destination table
    pub write_disposition: WriteDisposition,

    /// Query options; the client defaults when unset
    pub query: Option<QueryOptions>,

    /// How long to wait for the job; the client default when unset
    pub wait_timeout: Option<Duration>,
}

/// Simple BigQuery client reading query results into Arrow record batches and
/// writing record batches into tables.
///
/// The credential is resolved on first use and reused by every later
/// operation.
///
/// # Example
///
/// ```no_run
/// use bqlite::{BqConfig, BqLite};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let client = BqLite::new(BqConfig::from_env())?;
///
///     let batch = client
///         .read_table("SELECT name, number FROM `bigquery-public-data.usa_names.usa_1910_2013` LIMIT 10", "my-project")
///         .await?;
///     println!("Read {} rows", batch.num_rows());
///
///     client.write_table(&batch, "my-project", "my_dataset", "names").await?;
///     Ok(())
/// }
/// ```
pub struct BqLite {
    config: BqConfig,
    connector: Arc<dyn Connector>,
    credentials: OnceCell<Credentials>,
}

impl BqLite {
    /// Client talking to the BigQuery REST API
    pub fn new(config: BqConfig) -> BqResult<Self> {
        let connector = Arc::new(HttpConnector::new(config.api.clone())?);
        Self::with_connector(config, connector)
    }

    /// Client using a custom connector
    pub fn with_connector(config: BqConfig, connector: Arc<dyn Connector>) -> BqResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connector,
            credentials: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &BqConfig {
        &self.config
    }

    async fn credentials(&self) -> BqResult<&Credentials> {
        self.credentials
            .get_or_try_init(async {
                let resolver = CredentialResolver::new(self.config.credentials.clone());
                let (source, credentials) = resolver.resolve().await?;
                info!(
                    "Using {} credentials from {:?}",
                    credentials.kind(),
                    source
                );
                Ok::<_, BqError>(credentials)
            })
            .await
    }

    async fn connect(&self, project: &str) -> BqResult<Box<dyn WarehouseService>> {
        let credentials = self.credentials().await?.clone();
        self.connector.connect(project, credentials).await
    }

    /// Run a query and return its whole result as one record batch
    pub async fn read_table(&self, query: &str, project: &str) -> BqResult<RecordBatch> {
        self.read_table_with(query, project, &self.config.query)
            .await
    }

    /// [`BqLite::read_table`] with per-call query options
    pub async fn read_table_with(
        &self,
        query: &str,
        project: &str,
        options: &QueryOptions,
    ) -> BqResult<RecordBatch> {
        options.validate()?;
        let service = self.connect(project).await?;
        let request = QueryRequest {
            query: query.to_string(),
            options: options.clone(),
            timeout_ms: self.config.api.query_timeout_ms,
        };

        let mut cursor = QueryCursor::start(service.as_ref(), &request).await?;
        let expected_rows = cursor.total_rows().and_then(|n| usize::try_from(n).ok());
        let mut materializer = match cursor.schema() {
            Some(schema) => ResultMaterializer::with_schema(schema.clone(), expected_rows),
            None => ResultMaterializer::new(expected_rows),
        };

        let mut pages = 0usize;
        while let Some(rows) = cursor.next_page().await? {
            pages += 1;
            materializer.push_batch(rows)?;
        }

        let batch = materializer.finish()?;
        info!(
            "Read {} rows in {} page(s) from job {}",
            batch.num_rows(),
            pages,
            cursor.job().job_id
        );
        Ok(batch)
    }

    /// Insert a record batch into a table, creating the table from the batch
    /// schema when it does not exist
    pub async fn write_table(
        &self,
        batch: &RecordBatch,
        project: &str,
        dataset: &str,
        table: &str,
    ) -> BqResult<()> {
        let service = self.connect(project).await?;
        require_dataset(service.as_ref(), dataset).await?;

        let (schema, exists) = match service.get_table(dataset, table).await? {
            Some(schema) => (schema, true),
            None => {
                info!("Table {}:{} does not exist", dataset, table);
                (TableSchema::from_arrow(&batch.schema()), false)
            }
        };

        // Shape errors surface before anything is written remotely
        let rows = encode_batch(batch, &schema)?;

        if !exists {
            service.create_table(dataset, table, &schema).await?;
            info!("Created table {}:{}", dataset, table);
        }

        if rows.is_empty() {
            debug!("No rows to insert into {}:{}", dataset, table);
            return Ok(());
        }

        let total = rows.len();
        let mut rejected: Vec<RowInsertError> = Vec::new();
        let mut offset = 0;
        let mut rows = rows.into_iter();
        loop {
            let chunk: Vec<_> = rows.by_ref().take(INSERT_CHUNK_ROWS).collect();
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len();
            let errors = service.insert_rows(dataset, table, chunk).await?;
            rejected.extend(errors.into_iter().map(|mut e| {
                e.index += offset;
                e
            }));
            offset += len;
        }

        if !rejected.is_empty() {
            return Err(BqError::InsertFailed(rejected));
        }
        info!("Loaded {} rows into {}:{}", total, dataset, table);
        Ok(())
    }

    /// Create an empty table; the dataset must exist and the table must not
    pub async fn create_table(
        &self,
        schema: &TableSchema,
        project: &str,
        dataset: &str,
        table: &str,
    ) -> BqResult<()> {
        let service = self.connect(project).await?;
        require_dataset(service.as_ref(), dataset).await?;

        if service.get_table(dataset, table).await?.is_some() {
            return Err(BqError::TableAlreadyExists {
                dataset: dataset.to_string(),
                table: table.to_string(),
            });
        }

        service.create_table(dataset, table, schema).await?;
        info!(
            "Created table {}:{} with {} column(s)",
            dataset,
            table,
            schema.len()
        );
        Ok(())
    }

    /// Delete a table; the dataset and the table must exist
    pub async fn delete_table(&self, project: &str, dataset: &str, table: &str) -> BqResult<()> {
        let service = self.connect(project).await?;
        require_dataset(service.as_ref(), dataset).await?;

        if service.get_table(dataset, table).await?.is_none() {
            return Err(BqError::TableNotFound {
                dataset: dataset.to_string(),
                table: table.to_string(),
            });
        }

        service.delete_table(dataset, table).await?;
        info!("Deleted table {}:{}", dataset, table);
        Ok(())
    }

    /// Run a query as a job writing into a destination table.
    ///
    /// Returns the job state observed last: `Done` on success, or the pending
    /// state when the wait timed out.
    pub async fn read_to_table(
        &self,
        query: &str,
        project: &str,
        dataset: &str,
        table: &str,
        options: &ReadToTableOptions,
    ) -> BqResult<JobState> {
        let query_options = options.query.as_ref().unwrap_or(&self.config.query);
        query_options.validate()?;
        let service = self.connect(project).await?;

        let job = QueryJob {
            job_id: format!(
                "{}_{}_read_to_bq{}",
                dataset,
                table,
                chrono::Local::now().format("%Y%m%d%H%M%S")
            ),
            query: query.to_string(),
            options: query_options.clone(),
            destination: TableReference::new(project, dataset, table),
            write_disposition: options.write_disposition,
        };
        let job_ref = service.insert_query_job(&job).await?;
        info!(
            "Started job {} writing into {} ({})",
            job_ref.job_id,
            job.destination,
            job.write_disposition.as_str()
        );

        let timeout = options
            .wait_timeout
            .unwrap_or_else(|| self.config.api.wait_timeout());
        let state = wait_for_job(
            service.as_ref(),
            &job_ref,
            self.config.api.poll_interval(),
            timeout,
        )
        .await?;

        if state == JobState::Done {
            info!("Wrote query result into {}", job.destination);
        } else {
            warn!(
                "Timed out after {:?} waiting for job {} writing into {}",
                timeout, job_ref.job_id, job.destination
            );
        }
        Ok(state)
    }
}

async fn require_dataset(service: &dyn WarehouseService, dataset: &str) -> BqResult<()> {
    if service.dataset_exists(dataset).await? {
        Ok(())
    } else {
        Err(BqError::DatasetNotFound(dataset.to_string()))
    }
}

impl fmt::Debug for BqLite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BqLite")
            .field("base_url", &self.config.api.base_url)
            .field("credentials_resolved", &self.credentials.get().is_some())
            .finish()
    }
}
