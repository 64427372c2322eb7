use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::rpc::{RpcRequest, RpcResponse};
use super::task::{TaskPayload, TaskType};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Created,
    Uploading,
    Received,
    Finished,
    Terminated,
    Failed,
}

impl UploadStatus {
    /// Whether the raw transfer may still move forward.
    pub fn is_transferring(&self) -> bool {
        matches!(self, UploadStatus::Created | UploadStatus::Uploading)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadStatus::Finished | UploadStatus::Terminated | UploadStatus::Failed
        )
    }
}

impl Display for UploadStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            UploadStatus::Created => write!(f, "created"),
            UploadStatus::Uploading => write!(f, "uploading"),
            UploadStatus::Received => write!(f, "received"),
            UploadStatus::Finished => write!(f, "finished"),
            UploadStatus::Terminated => write!(f, "terminated"),
            UploadStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for UploadStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(UploadStatus::Created),
            "uploading" => Ok(UploadStatus::Uploading),
            "received" | "processing" => Ok(UploadStatus::Received),
            "finished" => Ok(UploadStatus::Finished),
            "terminated" => Ok(UploadStatus::Terminated),
            "failed" => Ok(UploadStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid upload status: {}", s)),
        }
    }
}

/// Persistent record of one resumable upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Upload {
    pub id: String,
    pub user_id: i64,
    pub size: i64,
    pub received: i64,
    pub status: UploadStatus,
    pub filename: String,
    pub path: String,
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Upload {
    pub fn new(id: impl Into<String>, user_id: i64, size: i64, filename: impl Into<String>) -> Self {
        let now = Utc::now();
        Upload {
            id: id.into(),
            user_id,
            size,
            received: 0,
            status: UploadStatus::Created,
            filename: filename.into(),
            path: String::new(),
            error: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_owned_by(&self, user_id: i64) -> bool {
        self.user_id == user_id
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Upload {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Upload {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            size: row.try_get("size")?,
            received: row.try_get("received")?,
            status: row.try_get::<String, _>("status")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse upload status: {}", e).into())
            })?,
            filename: row.try_get("filename")?,
            path: row.try_get("path")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Received,
    Succeeded,
    Failed,
}

impl QueryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryStatus::Received)
    }
}

impl Display for QueryStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            QueryStatus::Received => write!(f, "received"),
            QueryStatus::Succeeded => write!(f, "succeeded"),
            QueryStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for QueryStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "received" => Ok(QueryStatus::Received),
            "succeeded" => Ok(QueryStatus::Succeeded),
            "failed" => Ok(QueryStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid query status: {}", s)),
        }
    }
}

/// Publish request linked 1:1 to an upload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Query {
    pub id: Uuid,
    pub upload_id: String,
    pub status: QueryStatus,
    pub request: RpcRequest,
    pub response: Option<RpcResponse>,
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Query {
    pub fn new(upload_id: impl Into<String>, request: RpcRequest) -> Self {
        let now = Utc::now();
        Query {
            id: Uuid::new_v4(),
            upload_id: upload_id.into(),
            status: QueryStatus::Received,
            request,
            response: None,
            error: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Query {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let request: serde_json::Value = row.try_get("request")?;
        let response: Option<serde_json::Value> = row.try_get("response")?;
        Ok(Query {
            id: row.try_get("id")?,
            upload_id: row.try_get("upload_id")?,
            status: row.try_get::<String, _>("status")?.parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse query status: {}", e).into())
            })?,
            request: serde_json::from_value(request).map_err(|e| sqlx::Error::Decode(e.into()))?,
            response: response
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| sqlx::Error::Decode(e.into()))?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// What a polling client is told about an upload.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishStatus {
    Accepted,
    Succeeded(RpcResponse),
    Failed {
        error: String,
        response: Option<RpcResponse>,
    },
}

impl PublishStatus {
    pub fn from_records(upload: &Upload, query: Option<&Query>) -> Self {
        if let Some(q) = query {
            match q.status {
                QueryStatus::Succeeded => {
                    if let Some(response) = &q.response {
                        return PublishStatus::Succeeded(response.clone());
                    }
                }
                QueryStatus::Failed => {
                    return PublishStatus::Failed {
                        error: if q.error.is_empty() {
                            upload.error.clone()
                        } else {
                            q.error.clone()
                        },
                        response: q.response.clone(),
                    };
                }
                QueryStatus::Received => {}
            }
        }

        match upload.status {
            UploadStatus::Failed => PublishStatus::Failed {
                error: upload.error.clone(),
                response: None,
            },
            UploadStatus::Terminated => PublishStatus::Failed {
                error: "upload terminated".to_string(),
                response: None,
            },
            _ => PublishStatus::Accepted,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PublishStatus::Accepted)
    }
}

/// Payload of the `upload:process` task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadProcessPayload {
    pub upload_id: String,
    pub path: String,
    pub user_id: i64,
    pub request: RpcRequest,
}

impl TaskPayload for UploadProcessPayload {
    fn task_type() -> TaskType {
        TaskType::UPLOAD_PROCESS
    }
}

/// Payload of the `upload:process:result` task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadProcessResult {
    pub upload_id: String,
    pub user_id: i64,
    #[serde(default)]
    pub sd_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<RpcResponse>,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub retry: bool,
}

impl UploadProcessResult {
    pub fn new(upload_id: impl Into<String>, user_id: i64) -> Self {
        Self {
            upload_id: upload_id.into(),
            user_id,
            sd_hash: String::new(),
            response: None,
            error: String::new(),
            retry: false,
        }
    }

    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }
}

impl TaskPayload for UploadProcessResult {
    fn task_type() -> TaskType {
        TaskType::UPLOAD_PROCESS_RESULT
    }
}
