//! Resolves a job's entry-point source to a local script file.
//!
//! Public models are fetched from `<public_url>/models/<id>.<framework>`,
//! private ones from `<public_url>/users/<user_id>/<id>.<framework>` signed
//! with the CDN query parameters from the credentials. Each model id is
//! downloaded once per process; concurrent requests share the download.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::credentials::Credentials;
use crate::job::{InvalidId, Source, check_file_id};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("private source {0} requires credentials")]
    MissingCredentials(String),
    #[error("invalid source url: {0}")]
    InvalidUrl(String),
    #[error("failed to download source: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to write script: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    InvalidId(#[from] InvalidId),
}

struct Remote {
    client: reqwest::Client,
    public_url: String,
    script_dir: PathBuf,
    cache: DashMap<String, Arc<OnceCell<String>>>,
}

/// Source loader. A disabled loader resolves nothing and workers receive no
/// `script` field.
#[derive(Clone)]
pub struct SourceLoader {
    remote: Option<Arc<Remote>>,
}

/// Script filename a worker loads, relative to its working directory.
/// Every id that goes into the name must be a plain file name component;
/// `user_id` and `framework` may be empty.
pub fn script_filename(source: &Source, user_id: &str) -> Result<String, SourceError> {
    check_file_id("model_id", &source.model_id)?;
    for (field, value) in [("framework", source.framework.as_str()), ("user_id", user_id)] {
        if !value.is_empty() {
            check_file_id(field, value)?;
        }
    }
    let ext = match source.framework.as_str() {
        "js" => "mjs",
        other => other,
    };
    Ok(format!("script_{}_{}.{}", user_id, source.model_id, ext))
}

impl SourceLoader {
    pub fn disabled() -> Self {
        Self { remote: None }
    }

    /// Loader fetching from `public_url` into `script_dir`.
    pub fn remote(
        public_url: impl Into<String>,
        script_dir: impl Into<PathBuf>,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            remote: Some(Arc::new(Remote {
                client,
                public_url: public_url.into().trim_end_matches('/').to_string(),
                script_dir: script_dir.into(),
                cache: DashMap::new(),
            })),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.remote.is_some()
    }

    /// Download `sources[0]` if needed and return its script filename.
    pub async fn resolve(
        &self,
        sources: &[Source],
        credentials: Option<&Credentials>,
    ) -> Result<Option<String>, SourceError> {
        let (Some(remote), Some(source)) = (&self.remote, sources.first()) else {
            return Ok(None);
        };

        let cell = remote
            .cache
            .entry(source.model_id.clone())
            .or_default()
            .clone();
        let filename = cell
            .get_or_try_init(|| remote.fetch(source, credentials))
            .await?;
        Ok(Some(filename.clone()))
    }
}

impl Remote {
    fn url(&self, source: &Source, credentials: Option<&Credentials>) -> Result<String, SourceError> {
        if !source.private {
            return Ok(format!(
                "{}/models/{}.{}",
                self.public_url, source.model_id, source.framework
            ));
        }

        let creds =
            credentials.ok_or_else(|| SourceError::MissingCredentials(source.model_id.clone()))?;
        let url = format!(
            "{}/users/{}/{}.{}",
            self.public_url, creds.user_id, source.model_id, source.framework
        );
        if creds.cdn.is_empty() {
            return Ok(url);
        }
        reqwest::Url::parse_with_params(&url, creds.cdn_query())
            .map(String::from)
            .map_err(|e| SourceError::InvalidUrl(e.to_string()))
    }

    async fn fetch(
        &self,
        source: &Source,
        credentials: Option<&Credentials>,
    ) -> Result<String, SourceError> {
        let user_id = credentials.map(|c| c.user_id.as_str()).unwrap_or_default();
        let filename = script_filename(source, user_id)?;
        let url = self.url(source, credentials)?;

        tracing::info!(model_id = %source.model_id, %filename, "Downloading model source");
        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        tokio::fs::write(self.script_dir.join(&filename), &body).await?;
        tracing::debug!(model_id = %source.model_id, bytes = body.len(), "Model source written");
        Ok(filename)
    }
}
