//! Link lookups and searches through yt-dlp, via songbird's `YoutubeDl` input.

use async_trait::async_trait;
use reqwest::Client;
use songbird::input::{AuxMetadata, Compose, YoutubeDl};
use tracing::{debug, warn};

use crate::Error;
use crate::platforms::MediaSearch;
use tunebot_common::models::{Song, Source};

#[derive(Clone)]
pub struct YtDlpSearch {
    client: Client,
}

impl YtDlpSearch {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn song_from_metadata(meta: AuxMetadata, fallback_url: &str) -> Song {
    let url = meta.source_url.unwrap_or_else(|| fallback_url.to_string());
    let title = match (meta.title, meta.artist) {
        (Some(title), _) => title,
        (None, Some(artist)) => artist,
        (None, None) => url.clone(),
    };
    Song::new(title, Source::ProviderTrack { url })
}

#[async_trait]
impl MediaSearch for YtDlpSearch {
    async fn lookup(&self, url: &str) -> Result<Song, Error> {
        let mut input = YoutubeDl::new(self.client.clone(), url.to_string());
        let meta = input.aux_metadata().await.map_err(|e| {
            warn!("yt-dlp lookup of {url} failed: {e}");
            Error::UpstreamUnavailable(e.to_string())
        })?;
        let song = song_from_metadata(meta, url);
        debug!("yt-dlp: {url} -> '{}'", song.title);
        Ok(song)
    }

    async fn search(&self, query: &str) -> Result<Option<Song>, Error> {
        let mut input = YoutubeDl::new_search(self.client.clone(), query.to_string());
        let results = input.search(Some(1)).await.map_err(|e| {
            warn!("yt-dlp search for '{query}' failed: {e}");
            Error::UpstreamUnavailable(e.to_string())
        })?;
        Ok(results
            .into_iter()
            .next()
            .and_then(|meta| {
                let fallback = meta.source_url.clone()?;
                Some(song_from_metadata(meta, &fallback))
            }))
    }
}
