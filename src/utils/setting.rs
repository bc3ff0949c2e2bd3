// Connectivity check run before any backup work starts.
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info};

use crate::errors::{BackupError, Result};
use crate::utils::server::ServerSession;

pub async fn check_db_connection(server: &dyn ServerSession, deadline: Duration) -> Result<()> {
    match timeout(deadline, server.ping()).await {
        Ok(Ok(())) => {
            info!(server = %server.identity(), "Successfully connected");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(server = %server.identity(), "Failed to connect: {:#}", e);
            Err(BackupError::Connection(format!("{}: {:#}", server.identity(), e)))
        }
        Err(_) => {
            error!(server = %server.identity(), "Connection check timed out");
            Err(BackupError::Connection(format!(
                "{}: no response within {}s",
                server.identity(),
                deadline.as_secs()
            )))
        }
    }
}
