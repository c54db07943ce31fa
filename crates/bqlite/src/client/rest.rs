// SPDX-License-Identifier: Apache-2.0

//! BigQuery v2 REST implementation of [`WarehouseService`]

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use super::{
    Connector, JobReference, JobState, JobStatus, PageRequest, QueryJob, QueryPage, QueryRequest,
    TableReference, WarehouseService,
};
use crate::auth::{Credentials, TokenProvider};
use crate::codec::{decode_rows, InsertRow, TableRow};
use crate::config::ApiConfig;
use crate::error::{BqError, BqResult, RowInsertError};
use crate::types::{FieldMode, FieldSchema, FieldType, TableSchema};
use crate::value::RowBatch;

/// Turn a non-success response into [`BqError::Api`]
pub(crate) async fn error_from_response(resp: Response) -> BqError {
    let status = resp.status();
    match resp.text().await {
        Ok(body) => api_error(status.as_u16(), &body),
        Err(e) => BqError::Http(e),
    }
}

fn api_error(status: u16, body: &str) -> BqError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope {
            error: ErrorDetail::Api(detail),
            ..
        }) => BqError::Api {
            status,
            reason: detail.errors.into_iter().find_map(|e| e.reason),
            message: detail.message,
        },
        // OAuth endpoints: {"error": "invalid_grant", "error_description": "..."}
        Ok(ErrorEnvelope {
            error: ErrorDetail::OAuth(code),
            error_description,
        }) => BqError::Api {
            status,
            message: error_description.unwrap_or_else(|| code.clone()),
            reason: Some(code),
        },
        Err(_) => BqError::Api {
            status,
            reason: None,
            message: body.trim().to_string(),
        },
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Api(ApiErrorBody),
    OAuth(String),
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl ErrorProto {
    fn describe(&self) -> String {
        format!(
            "{}: {}",
            self.reason.as_deref().unwrap_or("error"),
            self.message.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SchemaWire {
    #[serde(default)]
    fields: Vec<FieldWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FieldWire {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
}

impl From<&TableSchema> for SchemaWire {
    fn from(schema: &TableSchema) -> Self {
        Self {
            fields: schema
                .fields
                .iter()
                .map(|field| FieldWire {
                    name: field.name.clone(),
                    field_type: field.field_type.as_str().to_string(),
                    mode: Some(field.mode.as_str().to_string()),
                })
                .collect(),
        }
    }
}

impl TryFrom<SchemaWire> for TableSchema {
    type Error = BqError;

    fn try_from(wire: SchemaWire) -> BqResult<Self> {
        let fields = wire
            .fields
            .into_iter()
            .map(|field| {
                Ok(FieldSchema::new(field.name, FieldType::parse(&field.field_type)?)
                    .with_mode(FieldMode::parse(field.mode.as_deref())?))
            })
            .collect::<BqResult<Vec<_>>>()?;
        Ok(TableSchema::new(fields))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReferenceWire {
    project_id: String,
    dataset_id: String,
    table_id: String,
}

impl From<&TableReference> for TableReferenceWire {
    fn from(table: &TableReference) -> Self {
        Self {
            project_id: table.project_id.clone(),
            dataset_id: table.dataset_id.clone(),
            table_id: table.table_id.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    table_reference: Option<TableReferenceWire>,
    #[serde(default)]
    schema: Option<SchemaWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReferenceWire {
    project_id: String,
    job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<String>,
}

impl From<JobReferenceWire> for JobReference {
    fn from(wire: JobReferenceWire) -> Self {
        Self {
            project_id: wire.project_id,
            job_id: wire.job_id,
            location: wire.location,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequestWire<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    use_query_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_results: Option<u32>,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponseWire {
    job_reference: JobReferenceWire,
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    schema: Option<SchemaWire>,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    total_rows: Option<String>,
}

impl TryFrom<QueryResponseWire> for QueryPage {
    type Error = BqError;

    fn try_from(wire: QueryResponseWire) -> BqResult<Self> {
        let schema = wire.schema.map(TableSchema::try_from).transpose()?;
        let rows = match &schema {
            Some(schema) => decode_rows(schema, wire.rows)?,
            None if wire.rows.is_empty() => RowBatch::default(),
            None => {
                return Err(BqError::data_shape(
                    "query response carries rows but no schema",
                ))
            }
        };
        Ok(QueryPage {
            job: wire.job_reference.into(),
            complete: wire.job_complete,
            schema,
            rows,
            page_token: wire.page_token.filter(|t| !t.is_empty()),
            total_rows: wire.total_rows.and_then(|n| n.parse().ok()),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllRequest {
    kind: &'static str,
    skip_invalid_rows: bool,
    ignore_unknown_values: bool,
    rows: Vec<InsertRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<InsertErrorWire>,
}

#[derive(Debug, Deserialize)]
struct InsertErrorWire {
    index: usize,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobInsertWire<'a> {
    job_reference: JobReferenceWire,
    configuration: JobConfigurationWire<'a>,
}

#[derive(Debug, Serialize)]
struct JobConfigurationWire<'a> {
    query: QueryJobConfigWire<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryJobConfigWire<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    use_query_cache: bool,
    destination_table: TableReferenceWire,
    write_disposition: &'static str,
    create_disposition: &'static str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    allow_large_results: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobWire {
    job_reference: JobReferenceWire,
    #[serde(default)]
    status: Option<JobStatusWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusWire {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

impl TryFrom<JobStatusWire> for JobStatus {
    type Error = BqError;

    fn try_from(wire: JobStatusWire) -> BqResult<Self> {
        Ok(JobStatus {
            state: JobState::parse(&wire.state)?,
            error: wire.error_result.as_ref().map(ErrorProto::describe),
        })
    }
}

/// REST client for one project
pub struct HttpWarehouse {
    project: String,
    base_url: Url,
    http: reqwest::Client,
    tokens: Arc<TokenProvider>,
}

impl HttpWarehouse {
    pub fn new(
        project: impl Into<String>,
        api: &ApiConfig,
        http: reqwest::Client,
        tokens: Arc<TokenProvider>,
    ) -> BqResult<Self> {
        Ok(Self {
            project: project.into(),
            base_url: Url::parse(&api.base_url)?,
            http,
            tokens,
        })
    }

    fn url(&self, segments: &[&str]) -> BqResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                BqError::InvalidConfig(format!("base URL {} cannot take a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn table_url(&self, dataset: &str, table: &str, suffix: Option<&str>) -> BqResult<Url> {
        let mut segments = vec!["projects", self.project.as_str(), "datasets", dataset, "tables", table];
        segments.extend(suffix);
        self.url(&segments)
    }

    /// Authorize and send a request, turning error statuses into [`BqError::Api`]
    async fn send(&self, request: RequestBuilder) -> BqResult<Response> {
        let token = self.tokens.access_token().await?;
        let resp = request.bearer_auth(token).send().await?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(error_from_response(resp).await)
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> BqResult<T> {
        Ok(self.send(request).await?.json().await?)
    }
}

fn is_not_found(err: &BqError) -> bool {
    matches!(err, BqError::Api { status: 404, .. })
}

#[async_trait]
impl WarehouseService for HttpWarehouse {
    fn project(&self) -> &str {
        &self.project
    }

    async fn dataset_exists(&self, dataset: &str) -> BqResult<bool> {
        let url = self.url(&["projects", self.project.as_str(), "datasets", dataset])?;
        match self.send(self.http.get(url)).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn get_table(&self, dataset: &str, table: &str) -> BqResult<Option<TableSchema>> {
        let url = self.table_url(dataset, table, None)?;
        match self.send_json::<TableResource>(self.http.get(url)).await {
            Ok(resource) => TableSchema::try_from(resource.schema.unwrap_or_default()).map(Some),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_table(
        &self,
        dataset: &str,
        table: &str,
        schema: &TableSchema,
    ) -> BqResult<()> {
        let url = self.url(&["projects", self.project.as_str(), "datasets", dataset, "tables"])?;
        let body = TableResource {
            table_reference: Some(TableReferenceWire::from(&TableReference::new(
                &self.project,
                dataset,
                table,
            ))),
            schema: Some(SchemaWire::from(schema)),
        };
        self.send(self.http.post(url).json(&body)).await?;
        Ok(())
    }

    async fn delete_table(&self, dataset: &str, table: &str) -> BqResult<()> {
        let url = self.table_url(dataset, table, None)?;
        self.send(self.http.delete(url)).await?;
        Ok(())
    }

    async fn insert_rows(
        &self,
        dataset: &str,
        table: &str,
        rows: Vec<InsertRow>,
    ) -> BqResult<Vec<RowInsertError>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let url = self.table_url(dataset, table, Some("insertAll"))?;
        let body = InsertAllRequest {
            kind: "bigquery#tableDataInsertAllRequest",
            skip_invalid_rows: false,
            ignore_unknown_values: false,
            rows,
        };
        let resp: InsertAllResponse = self.send_json(self.http.post(url).json(&body)).await?;
        Ok(resp
            .insert_errors
            .into_iter()
            .map(|e| RowInsertError {
                index: e.index,
                errors: e.errors.iter().map(ErrorProto::describe).collect(),
            })
            .collect())
    }

    async fn query(&self, request: &QueryRequest) -> BqResult<QueryPage> {
        let url = self.url(&["projects", self.project.as_str(), "queries"])?;
        let body = QueryRequestWire {
            query: &request.query,
            use_legacy_sql: request.options.use_legacy_sql,
            use_query_cache: request.options.use_query_cache,
            max_results: request.options.max_results,
            timeout_ms: request.timeout_ms,
        };
        let resp: QueryResponseWire = self.send_json(self.http.post(url).json(&body)).await?;
        resp.try_into()
    }

    async fn query_results(&self, job: &JobReference, page: &PageRequest) -> BqResult<QueryPage> {
        let url = self.url(&["projects", job.project_id.as_str(), "queries", job.job_id.as_str()])?;
        let mut params = vec![("timeoutMs", page.timeout_ms.to_string())];
        if let Some(token) = &page.page_token {
            params.push(("pageToken", token.clone()));
        }
        if let Some(max) = page.max_results {
            params.push(("maxResults", max.to_string()));
        }
        if let Some(location) = &job.location {
            params.push(("location", location.clone()));
        }
        let resp: QueryResponseWire = self.send_json(self.http.get(url).query(&params)).await?;
        resp.try_into()
    }

    async fn insert_query_job(&self, job: &QueryJob) -> BqResult<JobReference> {
        let url = self.url(&["projects", self.project.as_str(), "jobs"])?;
        let body = JobInsertWire {
            job_reference: JobReferenceWire {
                project_id: self.project.clone(),
                job_id: job.job_id.clone(),
                location: None,
            },
            configuration: JobConfigurationWire {
                query: QueryJobConfigWire {
                    query: &job.query,
                    use_legacy_sql: job.options.use_legacy_sql,
                    use_query_cache: job.options.use_query_cache,
                    destination_table: TableReferenceWire::from(&job.destination),
                    write_disposition: job.write_disposition.as_str(),
                    create_disposition: "CREATE_IF_NEEDED",
                    // Legacy SQL refuses large results into a destination table otherwise
                    allow_large_results: job.options.use_legacy_sql,
                },
            },
        };
        let resp: JobWire = self.send_json(self.http.post(url).json(&body)).await?;
        Ok(resp.job_reference.into())
    }

    async fn job_status(&self, job: &JobReference) -> BqResult<JobStatus> {
        let url = self.url(&["projects", job.project_id.as_str(), "jobs", job.job_id.as_str()])?;
        let mut request = self.http.get(url);
        if let Some(location) = &job.location {
            request = request.query(&[("location", location)]);
        }
        let resp: JobWire = self.send_json(request).await?;
        match resp.status {
            Some(status) => status.try_into(),
            None => Ok(JobStatus {
                state: JobState::Pending,
                error: None,
            }),
        }
    }
}

impl fmt::Debug for HttpWarehouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpWarehouse")
            .field("project", &self.project)
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

/// Default [`Connector`] talking to the BigQuery REST API.
///
/// The token provider is shared across connections made with the same
/// credentials, so the access token is fetched once and reused until expiry.
pub struct HttpConnector {
    api: ApiConfig,
    http: reqwest::Client,
    tokens: Mutex<Option<Arc<TokenProvider>>>,
}

impl HttpConnector {
    pub fn new(api: ApiConfig) -> BqResult<Self> {
        api.validate()?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("bqlite/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            api,
            http,
            tokens: Mutex::new(None),
        })
    }

    async fn token_provider(&self, credentials: Credentials) -> Arc<TokenProvider> {
        let mut tokens = self.tokens.lock().await;
        match tokens.as_ref() {
            Some(provider) if provider.credentials() == &credentials => provider.clone(),
            _ => {
                debug!("Creating token provider for {} credentials", credentials.kind());
                let provider = Arc::new(TokenProvider::new(
                    credentials,
                    self.api.scope.clone(),
                    self.http.clone(),
                ));
                *tokens = Some(provider.clone());
                provider
            }
        }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        project: &str,
        credentials: Credentials,
    ) -> BqResult<Box<dyn WarehouseService>> {
        info!("Connecting to BigQuery project {}", project);
        let tokens = self.token_provider(credentials).await;
        let warehouse = HttpWarehouse::new(project, &self.api, self.http.clone(), tokens)?;
        Ok(Box::new(warehouse))
    }
}

impl fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnector")
            .field("base_url", &self.api.base_url)
            .finish()
    }
}
