//! On-disk storage for uploaded clips.
//!
//! Files get server-generated names and are served back under
//! [`PUBLIC_PREFIX`]. Only the public locator is stored in the database.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::header,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use mime_guess::MimeGuess;
use rand_core::{OsRng, RngCore};
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::{ApiError, ApiResult};

/// URL path prefix under which uploads are served.
pub const PUBLIC_PREFIX: &str = "/uploads";

const MAX_EXTENSION_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the upload directory if it does not exist yet.
    pub async fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating upload directory {}", self.root.display()))
    }

    /// Writes `bytes` under a fresh name and returns its public locator.
    pub async fn save(&self, original_name: Option<&str>, bytes: &[u8]) -> Result<String> {
        let name = generate_file_name(original_name);
        let path = self.root.join(&name);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing upload {}", path.display()))?;
        debug!(file = %name, size = bytes.len(), "stored upload");
        Ok(format!("{PUBLIC_PREFIX}/{name}"))
    }

    /// Streams a stored file back to the client.
    pub async fn stream(&self, name: &str) -> ApiResult<Response> {
        if !is_plain_file_name(name) {
            return Err(ApiError::not_found("file not found"));
        }
        let path = self.root.join(name);
        let file = File::open(&path)
            .await
            .map_err(|_| ApiError::not_found("file not found"))?;

        let body = Body::from_stream(ReaderStream::new(file));
        let mut response = body.into_response();
        if let Some(mime) = MimeGuess::from_path(&path).first() {
            if let Ok(value) = mime.to_string().parse() {
                response.headers_mut().insert(header::CONTENT_TYPE, value);
            }
        }
        Ok(response)
    }
}

/// `<unix millis>-<8 hex chars>[.<ext>]`, keeping a sanitized extension from
/// the client's file name.
fn generate_file_name(original_name: Option<&str>) -> String {
    let stem = format!("{}-{:08x}", Utc::now().timestamp_millis(), OsRng.next_u32());
    match original_name.and_then(extension) {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}

fn extension(name: &str) -> Option<String> {
    let (_, ext) = name.rsplit_once('.')?;
    let valid = !ext.is_empty()
        && ext.len() <= MAX_EXTENSION_LEN
        && ext.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| ext.to_ascii_lowercase())
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
