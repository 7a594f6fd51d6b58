//! Turns what a user typed into something the transport can play.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use url::Url;

use crate::Error;
use crate::platforms::MediaSearch;
use tunebot_common::models::{Song, Source};

pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "oga", "opus", "flac", "m4a", "aac", "webm"];

const YOUTUBE_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
];

pub fn has_audio_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Parses `input` as an absolute http(s) URL.
pub fn parse_http_url(input: &str) -> Option<Url> {
    let url = Url::parse(input.trim()).ok()?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Some(url),
        _ => None,
    }
}

pub fn is_youtube_url(url: &Url) -> bool {
    url.host_str()
        .map(|h| YOUTUBE_HOSTS.iter().any(|known| known.eq_ignore_ascii_case(h)))
        .unwrap_or(false)
}

fn is_direct_media_url(url: &Url) -> bool {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .map(has_audio_extension)
        .unwrap_or(false)
}

/// Last path segment of a URL, or the whole URL when there is none.
fn url_title(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(|s| urlencoding::decode(s).map(|c| c.into_owned()).unwrap_or_else(|_| s.to_string()))
        .unwrap_or_else(|| url.to_string())
}

pub struct SourceResolver {
    audio_root: Option<PathBuf>,
    search: Arc<dyn MediaSearch>,
    fetch_timeout: Duration,
}

impl SourceResolver {
    pub fn new(audio_root: Option<PathBuf>, search: Arc<dyn MediaSearch>, fetch_timeout: Duration) -> Self {
        Self {
            audio_root,
            search,
            fetch_timeout,
        }
    }

    pub fn audio_root(&self) -> Result<&Path, Error> {
        self.audio_root
            .as_deref()
            .ok_or_else(|| Error::Config("audio directory is not configured".into()))
    }

    /// A file name inside the audio root. Anything that could leave the
    /// root is refused before touching the filesystem, and the canonical
    /// result is checked again so symlinks cannot escape either.
    pub async fn resolve_local(&self, name: &str) -> Result<Song, Error> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidInput("no file name given".into()));
        }
        let root = self.audio_root()?;

        let relative = Path::new(name);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(Error::PermissionDenied(
                "That path is outside the audio directory.".into(),
            ));
        }

        let candidate = root.join(relative);
        let resolved = match tokio::fs::canonicalize(&candidate).await {
            Ok(path) => path,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(name.to_string()));
            }
            Err(e) => return Err(Error::Io(e)),
        };
        let root = tokio::fs::canonicalize(root).await?;
        if !resolved.starts_with(&root) {
            return Err(Error::PermissionDenied(
                "That path is outside the audio directory.".into(),
            ));
        }
        if !tokio::fs::metadata(&resolved).await?.is_file() {
            return Err(Error::FileNotFound(name.to_string()));
        }

        debug!("Resolved local file '{name}' to {}", resolved.display());
        Ok(Song::new(name, Source::LocalFile { path: resolved }))
    }

    /// `music <url>`: always a direct stream.
    pub fn resolve_stream(&self, input: &str) -> Result<Song, Error> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidInput("no URL given".into()));
        }
        let url = parse_http_url(input)
            .ok_or_else(|| Error::InvalidInput(format!("not an http(s) URL: {input}")))?;
        Ok(Song::new(url_title(&url), Source::RemoteStream { url: url.to_string() }))
    }

    /// A URL or free-text query: direct media streams as-is, anything else
    /// goes through the search provider.
    pub async fn resolve_remote(&self, input: &str) -> Result<Song, Error> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidInput("nothing to play".into()));
        }

        match parse_http_url(input) {
            Some(url) if is_direct_media_url(&url) && !is_youtube_url(&url) => {
                Ok(Song::new(url_title(&url), Source::RemoteStream { url: url.to_string() }))
            }
            Some(url) => {
                debug!("Looking up provider link {url}");
                self.bounded(self.search.lookup(url.as_str())).await
            }
            None => {
                debug!("Searching provider for '{input}'");
                self.bounded(self.search.search(input))
                    .await?
                    .ok_or_else(|| Error::NotFound(input.to_string()))
            }
        }
    }

    /// Routing for `play <arg>`: URLs go remote, anything that looks like
    /// an audio file name stays local, the rest is a search when streaming
    /// is on and a local name otherwise.
    pub async fn resolve_play(&self, input: &str, streaming: bool) -> Result<Song, Error> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidInput("usage: play <filename|url|query>".into()));
        }
        if parse_http_url(input).is_some() {
            if !streaming {
                return Err(Error::PermissionDenied("Streaming is disabled.".into()));
            }
            return self.resolve_remote(input).await;
        }
        if has_audio_extension(input) || !streaming {
            return self.resolve_local(input).await;
        }
        self.resolve_remote(input).await
    }

    /// Audio files in the root, sorted by name.
    pub async fn list_local(&self) -> Result<Vec<String>, Error> {
        let root = self.audio_root()?;
        let mut entries = tokio::fs::read_dir(root).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if has_audio_extension(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn bounded<T>(&self, fut: impl Future<Output = Result<T, Error>>) -> Result<T, Error> {
        match tokio::time::timeout(self.fetch_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ (Error::NotFound(_) | Error::InvalidInput(_) | Error::UpstreamUnavailable(_)))) => Err(e),
            Ok(Err(e)) => Err(Error::UpstreamUnavailable(e.to_string())),
            Err(_) => Err(Error::UpstreamTimeout(format!(
                "search provider did not answer within {}s",
                self.fetch_timeout.as_secs()
            ))),
        }
    }
}
