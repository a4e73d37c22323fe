//! Byte-streamable content handles returned by the metadata and artifact engine.

use crate::{AppError, AppResult};
use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::path::PathBuf;
use tokio::io::AsyncReadExt;

pub const JSON_MIME_TYPE: &str = "application/json";
pub const TARBALL_MIME_TYPE: &str = "application/x-tgz";

const FILE_CHUNK_SIZE: usize = 64 * 1024;

/// Where the bytes of a [`Content`] come from.
pub enum ContentBody {
    Bytes(Bytes),
    /// Lazily produced chunks; large documents are never materialized.
    Stream(BoxStream<'static, AppResult<Bytes>>),
    /// A file on local disk, read on demand.
    File(PathBuf),
}

impl std::fmt::Debug for ContentBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentBody::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            ContentBody::Stream(_) => write!(f, "Stream"),
            ContentBody::File(path) => write!(f, "File({})", path.display()),
        }
    }
}

/// Content handle with a mime type, handed to the serving boundary.
#[derive(Debug)]
pub struct Content {
    pub mime_type: String,
    /// Known length in bytes, `None` for streamed bodies.
    pub length: Option<u64>,
    pub body: ContentBody,
}

impl Content {
    pub fn json(bytes: Vec<u8>) -> Self {
        Self {
            mime_type: JSON_MIME_TYPE.to_string(),
            length: Some(bytes.len() as u64),
            body: ContentBody::Bytes(Bytes::from(bytes)),
        }
    }

    pub fn stream(mime_type: &str, stream: BoxStream<'static, AppResult<Bytes>>) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            length: None,
            body: ContentBody::Stream(stream),
        }
    }

    pub fn file(mime_type: &str, path: PathBuf, length: u64) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            length: Some(length),
            body: ContentBody::File(path),
        }
    }

    /// Drain the body into memory.
    pub async fn into_bytes(self) -> AppResult<Bytes> {
        match self.body {
            ContentBody::Bytes(bytes) => Ok(bytes),
            ContentBody::Stream(mut stream) => {
                let mut buffer = Vec::new();
                while let Some(chunk) = stream.next().await {
                    buffer.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(buffer))
            }
            ContentBody::File(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }
}

fn file_stream(path: PathBuf) -> BoxStream<'static, AppResult<Bytes>> {
    stream::unfold(
        (Some(path), None::<tokio::fs::File>),
        |(path, file)| async move {
            let mut file = match (path, file) {
                (_, Some(file)) => file,
                (Some(path), None) => match tokio::fs::File::open(&path).await {
                    Ok(file) => file,
                    Err(e) => return Some((Err(AppError::from(e)), (None, None))),
                },
                (None, None) => return None,
            };
            let mut buffer = vec![0u8; FILE_CHUNK_SIZE];
            match file.read(&mut buffer).await {
                Ok(0) => None,
                Ok(read) => {
                    buffer.truncate(read);
                    Some((Ok(Bytes::from(buffer)), (None, Some(file))))
                }
                Err(e) => Some((Err(AppError::from(e)), (None, None))),
            }
        },
    )
    .boxed()
}

impl IntoResponse for Content {
    fn into_response(self) -> Response {
        let body = match self.body {
            ContentBody::Bytes(bytes) => Body::from(bytes),
            ContentBody::Stream(stream) => Body::from_stream(stream),
            ContentBody::File(path) => Body::from_stream(file_stream(path)),
        };

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, self.mime_type);
        if let Some(length) = self.length {
            builder = builder.header(header::CONTENT_LENGTH, length);
        }
        builder.body(body).unwrap_or_else(|e| {
            AppError::InternalError(format!("Failed to build response: {e}")).into_response()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_content_into_bytes() {
        let chunks = vec![Ok(Bytes::from_static(b"{\"a\":")), Ok(Bytes::from_static(b"1}"))];
        let content = Content::stream(JSON_MIME_TYPE, stream::iter(chunks).boxed());
        assert_eq!(content.length, None);
        assert_eq!(content.into_bytes().await.unwrap(), Bytes::from_static(b"{\"a\":1}"));
    }

    #[tokio::test]
    async fn test_file_stream_reads_whole_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("blob.tgz");
        let data = vec![42u8; FILE_CHUNK_SIZE * 2 + 17];
        std::fs::write(&path, &data).unwrap();

        let mut stream = file_stream(path);
        let mut read = Vec::new();
        while let Some(chunk) = stream.next().await {
            read.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_missing_file_streams_error() {
        let mut stream = file_stream(PathBuf::from("/nonexistent/blob.tgz"));
        assert!(matches!(stream.next().await, Some(Err(AppError::Io(_)))));
        assert!(stream.next().await.is_none());
    }
}
