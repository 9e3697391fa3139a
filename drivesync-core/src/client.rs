use std::io::SeekFrom;
use std::path::Path;

use reqwest::{Client, StatusCode, header, redirect};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use url::Url;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";
const DEFAULT_PAGE_SIZE: u32 = 100;
const RESUME_INCOMPLETE: u16 = 308;
const UPLOAD_CONTENT_TYPE: &str = "application/octet-stream";
const UPLOAD_RESPONSE_FIELDS: &str = "id,name,mimeType,md5Checksum,size,modifiedTime";
const RATE_LIMIT_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "quotaExceeded",
];

pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Every chunk of a resumable upload except the last must be a multiple of this.
pub const CHUNK_ALIGNMENT: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        reason: Option<String>,
        body: String,
    },
    #[error("upload session response is missing a Location header")]
    MissingUploadSession,
    #[error("upload ended before the server confirmed completion")]
    IncompleteUpload,
}

/// Result of one PUT against a resumable upload session.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// The server holds bytes `0..confirmed` and expects the rest.
    Incomplete { confirmed: u64 },
    Complete(DriveFile),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    NotFound,
    Permanent,
}

#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl DriveClient {
    pub fn new(token: impl Into<String>) -> Result<Self, DriveError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, DriveError> {
        // 308 is "resume incomplete" for upload sessions, not a redirect.
        let http = Client::builder()
            .redirect(redirect::Policy::none())
            .build()?;
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub async fn list_files(
        &self,
        query: &str,
        fields: Option<&str>,
        page_token: Option<&str>,
        page_size: Option<u32>,
    ) -> Result<FileList, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("q", query);
            pairs.append_pair("spaces", "drive");
            if let Some(fields) = fields.filter(|f| !f.is_empty()) {
                pairs.append_pair("fields", fields);
            }
            if let Some(page_token) = page_token {
                pairs.append_pair("pageToken", page_token);
            }
            if let Some(page_size) = page_size {
                pairs.append_pair("pageSize", &page_size.to_string());
            }
        }
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn list_files_all(
        &self,
        query: &str,
        fields: Option<&str>,
    ) -> Result<Vec<DriveFile>, DriveError> {
        let mut page_token: Option<String> = None;
        let mut files = Vec::new();
        loop {
            let page = self
                .list_files(
                    query,
                    fields,
                    page_token.as_deref(),
                    Some(DEFAULT_PAGE_SIZE),
                )
                .await?;
            files.extend(page.files);
            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(files)
    }

    pub async fn create_folder(&self, name: &str, parent_id: &str) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        url.query_pairs_mut().append_pair("fields", "id,name,mimeType");
        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .json(&json!({
                "name": name,
                "mimeType": FOLDER_MIME_TYPE,
                "parents": [parent_id],
            }))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn get_file(
        &self,
        file_id: &str,
        fields: Option<&[&str]>,
    ) -> Result<DriveFile, DriveError> {
        let mut url = self.endpoint("/drive/v3/files")?;
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(file_id);
        }
        if let Some(fields) = fields.filter(|f| !f.is_empty()) {
            url.query_pairs_mut()
                .append_pair("fields", &fields.join(","));
        }
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    pub async fn start_upload_session(
        &self,
        name: &str,
        parent_id: &str,
        size: u64,
    ) -> Result<Url, DriveError> {
        let mut url = self.endpoint("/upload/drive/v3/files")?;
        url.query_pairs_mut()
            .append_pair("uploadType", "resumable")
            .append_pair("fields", UPLOAD_RESPONSE_FIELDS);
        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, self.auth_header_value())
            .header("X-Upload-Content-Length", size.to_string())
            .header("X-Upload-Content-Type", UPLOAD_CONTENT_TYPE)
            .json(&json!({
                "name": name,
                "parents": [parent_id],
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(api_error(response).await);
        }
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(DriveError::MissingUploadSession)?;
        Ok(Url::parse(location)?)
    }

    /// Sends one chunk starting at `offset`. An empty chunk finalizes an empty upload.
    pub async fn upload_chunk(
        &self,
        session: &Url,
        data: Vec<u8>,
        offset: u64,
        total: u64,
    ) -> Result<ChunkOutcome, DriveError> {
        let len = data.len() as u64;
        let range = if len == 0 {
            format!("bytes */{total}")
        } else {
            format!("bytes {}-{}/{}", offset, offset + len - 1, total)
        };
        let response = self
            .http
            .put(session.clone())
            .header(header::AUTHORIZATION, self.auth_header_value())
            .header(header::CONTENT_RANGE, range)
            .body(data)
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() == RESUME_INCOMPLETE {
            let confirmed = response
                .headers()
                .get(header::RANGE)
                .and_then(|value| value.to_str().ok())
                .and_then(confirmed_bytes)
                .unwrap_or(0);
            return Ok(ChunkOutcome::Incomplete { confirmed });
        }
        if status.is_success() {
            return Ok(ChunkOutcome::Complete(response.json::<DriveFile>().await?));
        }
        Err(api_error(response).await)
    }

    /// Uploads `local_path` through a resumable session, resending from the
    /// offset the server confirmed after every chunk.
    pub async fn upload_file<F>(
        &self,
        local_path: &Path,
        name: &str,
        parent_id: &str,
        chunk_size: usize,
        mut progress: F,
    ) -> Result<DriveFile, DriveError>
    where
        F: FnMut(u64, u64),
    {
        let mut file = tokio::fs::File::open(local_path).await?;
        let total = file.metadata().await?.len();
        let session = self.start_upload_session(name, parent_id, total).await?;

        if total == 0 {
            let outcome = self.upload_chunk(&session, Vec::new(), 0, 0).await?;
            progress(0, 0);
            return match outcome {
                ChunkOutcome::Complete(created) => Ok(created),
                ChunkOutcome::Incomplete { .. } => Err(DriveError::IncompleteUpload),
            };
        }

        let chunk_size = aligned_chunk_size(chunk_size);
        let mut offset = 0u64;
        while offset < total {
            let want = chunk_size.min((total - offset) as usize);
            let mut buf = vec![0u8; want];
            file.read_exact(&mut buf).await?;
            match self.upload_chunk(&session, buf, offset, total).await? {
                ChunkOutcome::Complete(created) => {
                    progress(total, total);
                    return Ok(created);
                }
                ChunkOutcome::Incomplete { confirmed } => {
                    // A chunk that moves nothing forward would loop forever.
                    if confirmed <= offset || confirmed > total {
                        return Err(DriveError::IncompleteUpload);
                    }
                    if confirmed != offset + want as u64 {
                        file.seek(SeekFrom::Start(confirmed)).await?;
                    }
                    offset = confirmed;
                    progress(offset, total);
                }
            }
        }
        Err(DriveError::IncompleteUpload)
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, DriveError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DriveError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            Err(api_error(response).await)
        }
    }
}

impl DriveError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            DriveError::Api { status, reason, .. } => {
                Some(classify_api_status(*status, reason.as_deref()))
            }
            DriveError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            // A retry opens a fresh session.
            DriveError::IncompleteUpload => Some(ApiErrorClass::Transient),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.classification() == Some(ApiErrorClass::NotFound)
    }
}

/// Parses the `Range: bytes=0-N` header of a 308 reply into the number of
/// bytes the server holds.
fn confirmed_bytes(range: &str) -> Option<u64> {
    let (start, end) = range.trim().strip_prefix("bytes=")?.split_once('-')?;
    if start.trim() != "0" {
        return None;
    }
    end.trim().parse::<u64>().ok()?.checked_add(1)
}

/// Quotes a value for use inside a single-quoted files query literal.
pub fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

pub fn children_query(parent_id: &str) -> String {
    format!(
        "'{}' in parents and trashed=false",
        escape_query_value(parent_id)
    )
}

pub fn folder_query(parent_id: &str, name: &str) -> String {
    format!(
        "name='{}' and mimeType='{}' and '{}' in parents and trashed=false",
        escape_query_value(name),
        FOLDER_MIME_TYPE,
        escape_query_value(parent_id)
    )
}

pub fn aligned_chunk_size(requested: usize) -> usize {
    requested.max(1).div_ceil(CHUNK_ALIGNMENT) * CHUNK_ALIGNMENT
}

fn classify_api_status(status: StatusCode, reason: Option<&str>) -> ApiErrorClass {
    if status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN
            && reason.is_some_and(|reason| RATE_LIMIT_REASONS.contains(&reason)))
    {
        ApiErrorClass::RateLimit
    } else if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

async fn api_error(response: reqwest::Response) -> DriveError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    DriveError::Api {
        status,
        reason: error_reason(&body),
        body,
    }
}

fn error_reason(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct Envelope {
        error: ErrorBody,
    }
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        errors: Vec<ErrorDetail>,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        #[serde(default)]
        reason: Option<String>,
    }

    serde_json::from_str::<Envelope>(body)
        .ok()?
        .error
        .errors
        .into_iter()
        .find_map(|detail| detail.reason)
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub md5_checksum: Option<String>,
    #[serde(default)]
    pub modified_time: Option<String>,
    #[serde(default, deserialize_with = "size_from_api")]
    pub size: Option<u64>,
    #[serde(default)]
    pub trashed: Option<bool>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type.as_deref() == Some(FOLDER_MIME_TYPE)
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

// The API reports int64 sizes as JSON strings.
fn size_from_api<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Number(u64),
        Text(String),
    }

    match Option::<RawSize>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawSize::Number(value)) => Ok(Some(value)),
        Some(RawSize::Text(value)) => value
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
