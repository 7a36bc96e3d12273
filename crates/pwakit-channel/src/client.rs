//! Page-side client for the cache control protocol.

use std::sync::Arc;
use std::time::Duration;

use pwakit_common::with_timeout;
use tracing::{debug, warn};

use crate::{
    ChannelError, ControlCommand, ControlReply, MessageChannel, MessageTarget, WorkerMessage,
};

/// Default time to wait for a reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends control commands to the active worker and waits for the reply.
pub struct ControlClient {
    target: Arc<dyn MessageTarget>,
    timeout: Duration,
}

impl ControlClient {
    /// Create a client for the given worker.
    pub fn new(target: Arc<dyn MessageTarget>) -> Self {
        Self {
            target,
            timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Set the reply timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one command over a fresh channel.
    pub async fn send(&self, command: ControlCommand) -> Result<ControlReply, ChannelError> {
        if !self.target.has_controller().await {
            warn!(%command, "No active worker to send control command to");
            return Err(ChannelError::NoController);
        }

        let MessageChannel { mut port1, port2 } = MessageChannel::new();

        debug!(%command, port = ?port2.id, "Posting control command");
        let target = self.target.clone();

        // one deadline covers both the post and the reply
        let reply = with_timeout(self.timeout, move || async move {
            target
                .post_message(WorkerMessage::with_ports(command.to_message(), vec![port2]))
                .await?;
            Ok::<_, ChannelError>(port1.recv().await)
        })
        .await
        .map_err(|_| ChannelError::Timeout(self.timeout))??;

        let message = reply.ok_or(ChannelError::NoReply)?;

        ControlReply::from_message(command, message.data)
    }

    /// Stored request URLs of the current cache.
    pub async fn get_cache_contents(&self) -> Result<Vec<String>, ChannelError> {
        match self.send(ControlCommand::GetCacheContents).await? {
            ControlReply::CacheContents(urls) => Ok(urls),
            other => Err(ChannelError::UnexpectedReply(format!("{other:?}"))),
        }
    }

    /// Delete the current cache. Returns whether anything was deleted.
    pub async fn clear_cache(&self) -> Result<bool, ChannelError> {
        match self.send(ControlCommand::ClearCache).await? {
            ControlReply::Cleared(deleted) => Ok(deleted),
            other => Err(ChannelError::UnexpectedReply(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessagePort;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers every command with a fixed payload.
    struct CannedTarget;

    #[async_trait]
    impl MessageTarget for CannedTarget {
        async fn has_controller(&self) -> bool {
            true
        }

        async fn post_message(&self, mut message: WorkerMessage) -> Result<(), ChannelError> {
            let reply = match ControlCommand::from_message(&message.data) {
                Some(ControlCommand::GetCacheContents) => json!(["https://app.test/"]),
                Some(ControlCommand::ClearCache) => json!(true),
                None => return Ok(()),
            };
            if let Some(port) = message.take_reply_port() {
                port.reply(reply)?;
            }
            Ok(())
        }
    }

    /// Keeps ports alive and never answers.
    #[derive(Default)]
    struct SilentTarget {
        held: Mutex<Vec<MessagePort>>,
    }

    #[async_trait]
    impl MessageTarget for SilentTarget {
        async fn has_controller(&self) -> bool {
            true
        }

        async fn post_message(&self, message: WorkerMessage) -> Result<(), ChannelError> {
            self.held.lock().unwrap().extend(message.ports);
            Ok(())
        }
    }

    /// Accepts the message but never finishes handling it.
    struct HangingTarget;

    #[async_trait]
    impl MessageTarget for HangingTarget {
        async fn has_controller(&self) -> bool {
            true
        }

        async fn post_message(&self, _message: WorkerMessage) -> Result<(), ChannelError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    struct NoWorker;

    #[async_trait]
    impl MessageTarget for NoWorker {
        async fn has_controller(&self) -> bool {
            false
        }

        async fn post_message(&self, _message: WorkerMessage) -> Result<(), ChannelError> {
            unreachable!("client must check for a controller first")
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let client = ControlClient::new(Arc::new(CannedTarget));

        assert_eq!(
            client.get_cache_contents().await.unwrap(),
            vec!["https://app.test/".to_string()]
        );
        assert!(client.clear_cache().await.unwrap());
    }

    #[tokio::test]
    async fn test_no_controller() {
        let client = ControlClient::new(Arc::new(NoWorker));
        assert_eq!(client.clear_cache().await, Err(ChannelError::NoController));
    }

    #[tokio::test]
    async fn test_timeout_when_worker_stays_silent() {
        let target = Arc::new(SilentTarget::default());
        let client = ControlClient::new(target.clone()).timeout(Duration::from_millis(20));

        assert_eq!(
            client.get_cache_contents().await,
            Err(ChannelError::Timeout(Duration::from_millis(20)))
        );
        assert_eq!(target.held.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_when_post_never_completes() {
        let client =
            ControlClient::new(Arc::new(HangingTarget)).timeout(Duration::from_millis(50));

        let result = tokio::time::timeout(Duration::from_secs(2), client.clear_cache()).await;
        assert_eq!(
            result,
            Ok(Err(ChannelError::Timeout(Duration::from_millis(50))))
        );
    }

    #[tokio::test]
    async fn test_dropped_port_is_no_reply() {
        struct Dropper;

        #[async_trait]
        impl MessageTarget for Dropper {
            async fn has_controller(&self) -> bool {
                true
            }

            async fn post_message(&self, _message: WorkerMessage) -> Result<(), ChannelError> {
                Ok(())
            }
        }

        let client = ControlClient::new(Arc::new(Dropper));
        assert_eq!(client.clear_cache().await, Err(ChannelError::NoReply));
    }
}
