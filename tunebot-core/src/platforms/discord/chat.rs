use std::sync::Arc;

use async_trait::async_trait;
use twilight_http::Client as HttpClient;
use twilight_http::error::ErrorType;
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, UserMarker};

use crate::Error;
use crate::platforms::ChatClient;

/// `ChatClient` over the Discord REST API.
#[derive(Clone)]
pub struct DiscordChat {
    http: Arc<HttpClient>,
}

impl DiscordChat {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }
}

fn map_http_error(e: twilight_http::Error, what: &str) -> Error {
    match e.kind() {
        ErrorType::Response { status, .. } if status.get() == 404 => Error::NotFound(what.to_string()),
        ErrorType::Response { status, .. } if status.get() == 403 => {
            Error::PermissionDenied(format!("Not allowed to reach {what}."))
        }
        _ => Error::Platform(format!("Discord request for {what} failed: {e}")),
    }
}

#[async_trait]
impl ChatClient for DiscordChat {
    async fn send_message(&self, channel_id: Id<ChannelMarker>, text: &str) -> Result<(), Error> {
        self.http
            .create_message(channel_id)
            .content(text)
            .await
            .map_err(|e| map_http_error(e, &format!("channel {channel_id}")))?;
        Ok(())
    }

    async fn send_direct_message(&self, user_id: Id<UserMarker>, text: &str) -> Result<(), Error> {
        let channel = self
            .http
            .create_private_channel(user_id)
            .await
            .map_err(|e| map_http_error(e, &format!("user {user_id}")))?
            .model()
            .await
            .map_err(|e| Error::Platform(format!("Error parsing DM channel => {e}")))?;
        self.send_message(channel.id, text).await
    }

    async fn fetch_user_name(&self, user_id: Id<UserMarker>) -> Result<String, Error> {
        let user = self
            .http
            .user(user_id)
            .await
            .map_err(|e| map_http_error(e, &format!("user {user_id}")))?
            .model()
            .await
            .map_err(|e| Error::Platform(format!("Error parsing user => {e}")))?;
        Ok(user.global_name.unwrap_or(user.name))
    }
}
