// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::config::Channel;
use crate::error::FetchError;
use crate::http::HttpClient;
use crate::listing::Item;

use super::filename::artifact_filename;
use super::{Artifact, FetchAdapter, partial_path};

/// Downloads an item's enclosure directly over HTTP
pub struct HttpFetcher<C> {
    client: Arc<C>,
}

impl<C: HttpClient> HttpFetcher<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient + 'static> FetchAdapter for HttpFetcher<C> {
    async fn fetch(&self, channel: &Channel, item: &Item) -> Result<Artifact, FetchError> {
        let media = item.media.as_ref().ok_or_else(|| FetchError::NoMedia {
            item_id: item.item_id.clone(),
        })?;

        let output_path = channel.destination.join(artifact_filename(item));
        let bytes = download_to(self.client.as_ref(), media.url.as_str(), &output_path).await?;

        Ok(Artifact {
            files: vec![output_path],
            bytes,
        })
    }
}

/// Stream `url` into `output_path`
///
/// Data goes to a `.partial` sibling which is synced and then renamed, so the
/// final name only ever refers to a complete file.
async fn download_to<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
    output_path: &Path,
) -> Result<u64, FetchError> {
    let response = client
        .get_stream(url)
        .await
        .map_err(|e| FetchError::HttpFailed {
            url: url.to_string(),
            source: e,
        })?;

    if response.status >= 400 {
        return Err(FetchError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }

    let partial = partial_path(output_path);
    let mut file = File::create(&partial)
        .await
        .map_err(|e| FetchError::FileWriteFailed {
            path: partial.clone(),
            source: e,
        })?;

    let mut bytes_downloaded: u64 = 0;
    let mut stream = response.body;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| FetchError::StreamFailed {
            url: url.to_string(),
            source: e,
        })?;

        file.write_all(&chunk)
            .await
            .map_err(|e| FetchError::FileWriteFailed {
                path: partial.clone(),
                source: e,
            })?;

        bytes_downloaded += chunk.len() as u64;
    }

    file.flush().await.map_err(|e| FetchError::FileWriteFailed {
        path: partial.clone(),
        source: e,
    })?;
    file.sync_all()
        .await
        .map_err(|e| FetchError::FileWriteFailed {
            path: partial.clone(),
            source: e,
        })?;
    drop(file);

    tokio::fs::rename(&partial, output_path)
        .await
        .map_err(|e| FetchError::FinalizeFailed {
            from: partial.clone(),
            source: e,
        })?;

    Ok(bytes_downloaded)
}
