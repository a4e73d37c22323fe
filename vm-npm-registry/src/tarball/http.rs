use super::validator::{default_validators, run_validators, Validator};
use super::{Tarball, TarballRequest, TarballSource};
use crate::content::TARBALL_MIME_TYPE;
use crate::{AppError, AppResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header, Client};
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// [`TarballSource`] downloading from the version's `dist.tarball` URL.
pub struct HttpTarballSource {
    client: Client,
    temp_dir: PathBuf,
    validators: Vec<Validator>,
}

impl HttpTarballSource {
    pub fn new(client: Client, temp_dir: impl Into<PathBuf>) -> AppResult<Self> {
        let temp_dir = temp_dir.into();
        std::fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            client,
            temp_dir,
            validators: default_validators(),
        })
    }
}

#[async_trait]
impl TarballSource for HttpTarballSource {
    async fn get(&self, request: &TarballRequest) -> AppResult<Option<Tarball>> {
        let version = &request.package_version;
        let url = match version.dist_tarball() {
            Some(url) if !version.is_incomplete() => url.to_string(),
            _ => {
                return Err(AppError::BadRequest(format!(
                    "Version {}@{} has no complete distribution info",
                    version.name(),
                    version.version()
                )))
            }
        };

        tracing::info!(target: "remote.storage.outbound", method = "GET", url = %url, "Fetching tarball");
        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, TARBALL_MIME_TYPE)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(url = %url, status = %status, "Tarball not available");
            return Ok(None);
        }

        let spool = tempfile::Builder::new()
            .prefix(&format!("{}-tarball-", request.repository_id))
            .suffix(".tgz")
            .tempfile_in(&self.temp_dir)?;
        let (file, path) = spool.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut hasher = Sha1::new();
        let mut length = 0u64;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            length += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let tarball = Tarball::new(
            path,
            format!("{:x}", hasher.finalize()),
            length,
            url,
            version.clone(),
        );
        if !run_validators(&self.validators, request, &tarball) {
            return Ok(None);
        }
        tracing::debug!(
            repository = %request.repository_id,
            file = %request.target_file,
            bytes = tarball.length(),
            sha1 = %tarball.sha1sum(),
            "Tarball fetched"
        );
        Ok(Some(tarball))
    }
}
