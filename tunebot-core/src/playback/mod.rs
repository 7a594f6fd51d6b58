pub mod controller;
pub mod session;
pub mod source;
pub mod ticket;

use std::path::Path;

use tracing::{trace, warn};

pub use controller::{ControllerSettings, PlaybackController, PlaybackHandle};
pub use source::SourceResolver;
pub use ticket::RequestTicket;

/// Deletes a generated speech file. Already gone counts as success.
pub async fn remove_ephemeral_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => trace!("Removed ephemeral file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            trace!("Ephemeral file {} already gone", path.display());
        }
        Err(e) => warn!("Could not remove ephemeral file {}: {e}", path.display()),
    }
}
