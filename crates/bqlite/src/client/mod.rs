// SPDX-License-Identifier: Apache-2.0

//! Remote warehouse interface
//!
//! [`WarehouseService`] is the seam between the caller-facing operations and
//! the BigQuery REST API. [`Connector`] builds one service per project from
//! resolved credentials; [`rest::HttpConnector`] is the default.

pub mod rest;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::auth::Credentials;
use crate::codec::InsertRow;
use crate::config::{QueryOptions, WriteDisposition};
use crate::error::{BqError, BqResult, RowInsertError};
use crate::types::TableSchema;
use crate::value::RowBatch;

/// Fully qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableReference {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableReference {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }
}

impl fmt::Display for TableReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

/// Identifies a query or copy job
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobReference {
    pub project_id: String,
    pub job_id: String,
    pub location: Option<String>,
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
}

impl JobState {
    pub fn parse(state: &str) -> BqResult<Self> {
        match state {
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "DONE" => Ok(JobState::Done),
            other => Err(BqError::data_shape(format!("unknown job state {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
        }
    }
}

/// Job state plus the error result of a finished job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub error: Option<String>,
}

/// Synchronous query call
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query: String,
    pub options: QueryOptions,
    /// Server-side wait before the call returns an incomplete job
    pub timeout_ms: u64,
}

/// Paging parameters for one results call
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
    pub page_token: Option<String>,
    pub max_results: Option<u32>,
    pub timeout_ms: u64,
}

/// One response of the query or results endpoints.
///
/// While `complete` is false the page carries no schema and no rows.
#[derive(Debug, Clone)]
pub struct QueryPage {
    pub job: JobReference,
    pub complete: bool,
    pub schema: Option<TableSchema>,
    pub rows: RowBatch,
    pub page_token: Option<String>,
    pub total_rows: Option<u64>,
}

/// Query job writing its result into a table
#[derive(Debug, Clone)]
pub struct QueryJob {
    pub job_id: String,
    pub query: String,
    pub options: QueryOptions,
    pub destination: TableReference,
    pub write_disposition: WriteDisposition,
}

/// BigQuery operations used by [`crate::BqLite`], bound to one project
#[async_trait]
pub trait WarehouseService: Send + Sync + fmt::Debug {
    /// Project the service is bound to
    fn project(&self) -> &str;

    async fn dataset_exists(&self, dataset: &str) -> BqResult<bool>;

    /// Schema of the table, or `None` when it does not exist
    async fn get_table(&self, dataset: &str, table: &str) -> BqResult<Option<TableSchema>>;

    async fn create_table(&self, dataset: &str, table: &str, schema: &TableSchema)
        -> BqResult<()>;

    async fn delete_table(&self, dataset: &str, table: &str) -> BqResult<()>;

    /// Stream rows into the table, returning the rows the service rejected
    async fn insert_rows(
        &self,
        dataset: &str,
        table: &str,
        rows: Vec<InsertRow>,
    ) -> BqResult<Vec<RowInsertError>>;

    /// Run a query and return its first page
    async fn query(&self, request: &QueryRequest) -> BqResult<QueryPage>;

    /// Fetch a page of a query job's results
    async fn query_results(&self, job: &JobReference, page: &PageRequest) -> BqResult<QueryPage>;

    async fn insert_query_job(&self, job: &QueryJob) -> BqResult<JobReference>;

    async fn job_status(&self, job: &JobReference) -> BqResult<JobStatus>;
}

/// Builds a [`WarehouseService`] for a project from resolved credentials
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        project: &str,
        credentials: Credentials,
    ) -> BqResult<Box<dyn WarehouseService>>;
}

/// Sequential reader over the pages of one query result.
///
/// Pages are fetched one at a time, each request carrying the token returned
/// by the previous page.
pub struct QueryCursor<'a> {
    service: &'a dyn WarehouseService,
    job: JobReference,
    schema: Option<TableSchema>,
    total_rows: Option<u64>,
    max_results: Option<u32>,
    timeout_ms: u64,
    pending: Option<RowBatch>,
    page_token: Option<String>,
    exhausted: bool,
}

impl<'a> QueryCursor<'a> {
    /// Start the query and wait until its first page is available
    pub async fn start(service: &'a dyn WarehouseService, request: &QueryRequest) -> BqResult<Self> {
        let mut page = service.query(request).await?;
        debug!("Started query job {}", page.job.job_id);

        let max_results = request.options.max_results;
        while !page.complete {
            trace!("Query job {} not complete yet", page.job.job_id);
            let wait = PageRequest {
                page_token: None,
                max_results,
                timeout_ms: request.timeout_ms,
            };
            page = service.query_results(&page.job, &wait).await?;
        }

        Ok(Self {
            service,
            job: page.job,
            schema: page.schema,
            total_rows: page.total_rows,
            max_results,
            timeout_ms: request.timeout_ms,
            exhausted: page.page_token.is_none(),
            page_token: page.page_token,
            pending: Some(page.rows),
        })
    }

    pub fn job(&self) -> &JobReference {
        &self.job
    }

    /// Result schema reported by the service
    pub fn schema(&self) -> Option<&TableSchema> {
        self.schema.as_ref()
    }

    /// Total row count reported by the service
    pub fn total_rows(&self) -> Option<u64> {
        self.total_rows
    }

    /// Next page of rows, or `None` after the last page
    pub async fn next_page(&mut self) -> BqResult<Option<RowBatch>> {
        if let Some(rows) = self.pending.take() {
            return Ok(Some(rows));
        }
        if self.exhausted {
            return Ok(None);
        }

        let request = PageRequest {
            page_token: self.page_token.clone(),
            max_results: self.max_results,
            timeout_ms: self.timeout_ms,
        };
        let mut page = self.service.query_results(&self.job, &request).await?;
        while !page.complete {
            page = self.service.query_results(&self.job, &request).await?;
        }

        trace!(
            "Fetched {} rows of job {}",
            page.rows.num_rows(),
            self.job.job_id
        );
        self.exhausted = page.page_token.is_none();
        self.page_token = page.page_token;
        Ok(Some(page.rows))
    }
}

/// Poll a job until it is done or `timeout` elapses.
///
/// Returns the last observed state; a done job with an error result fails with
/// [`BqError::JobFailed`].
pub async fn wait_for_job(
    service: &dyn WarehouseService,
    job: &JobReference,
    poll_interval: Duration,
    timeout: Duration,
) -> BqResult<JobState> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = service.job_status(job).await?;
        trace!("Job {} is {}", job.job_id, status.state.as_str());

        if status.state == JobState::Done {
            return match status.error {
                Some(message) => Err(BqError::JobFailed {
                    job_id: job.job_id.clone(),
                    message,
                }),
                None => Ok(JobState::Done),
            };
        }
        if tokio::time::Instant::now() + poll_interval > deadline {
            return Ok(status.state);
        }
        tokio::time::sleep(poll_interval).await;
    }
}
