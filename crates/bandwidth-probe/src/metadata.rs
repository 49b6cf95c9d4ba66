use crate::{Error, Result, types::ConnectionMetadata};
use reqwest::Client;
use tracing::info;
use url::Url;

/// Fetches the measuring client's network context before a session starts.
pub struct MetadataClient {
    client: Client,
    url: Url,
}

impl MetadataClient {
    pub fn new(client: Client, url: Url) -> Self {
        Self { client, url }
    }

    pub async fn fetch(&self) -> Result<ConnectionMetadata> {
        let metadata: ConnectionMetadata = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(metadata_failure)?
            .json()
            .await
            .map_err(metadata_failure)?;

        info!(
            colo = metadata.colo.as_deref().unwrap_or("unknown"),
            asn = metadata.asn,
            protocol = metadata.http_protocol.as_deref().unwrap_or("unknown"),
            "fetched connection metadata"
        );

        Ok(metadata)
    }
}

fn metadata_failure(err: reqwest::Error) -> Error {
    Error::MetadataFetch(Box::new(err))
}
