//! Worker side of the cache control channel.

use pwakit_channel::{ControlCommand, ControlReply, WorkerMessage};
use tracing::{debug, warn};

use crate::controller::AssetCacheController;
use crate::ServiceWorkerError;

impl AssetCacheController {
    /// Handle one control message.
    ///
    /// Exactly one reply goes out on the message's first port, which is then
    /// dropped. Unknown commands, a missing port or a failing cache produce no
    /// reply; the caller's timeout covers those. Returns the command answered.
    pub async fn on_control_message(&self, mut message: WorkerMessage) -> Option<ControlCommand> {
        let Some(command) = ControlCommand::from_message(&message.data) else {
            debug!(data = %message.data, "Ignoring unknown control message");
            return None;
        };

        let Some(port) = message.take_reply_port() else {
            warn!(%command, "Control message without reply port");
            return None;
        };

        let reply = match self.execute(command).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(%command, error = %e, "Control command failed");
                return None;
            }
        };

        if let Err(e) = port.reply(reply.to_message()) {
            debug!(%command, error = %e, "Requester went away before the reply");
        }
        Some(command)
    }

    async fn execute(&self, command: ControlCommand) -> Result<ControlReply, ServiceWorkerError> {
        match command {
            ControlCommand::GetCacheContents => {
                let cache = self.caches().open(self.cache_name()).await?;
                let urls = cache
                    .keys()
                    .await
                    .into_iter()
                    .map(|key| key.url.to_string())
                    .collect();
                Ok(ControlReply::CacheContents(urls))
            }
            ControlCommand::ClearCache => {
                let deleted = self.caches().delete(self.cache_name()).await;
                debug!(cache = %self.cache_name(), deleted, "Cache cleared");
                Ok(ControlReply::Cleared(deleted))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStorage, MemoryCacheStorage};
    use crate::config::WorkerConfig;
    use crate::testing::FakeNetwork;
    use pwakit_channel::MessageChannel;
    use serde_json::json;
    use std::sync::Arc;
    use url::Url;

    async fn seeded() -> (AssetCacheController, Arc<MemoryCacheStorage>) {
        let network = Arc::new(FakeNetwork::default());
        network.serve("https://app.test/", 200, "root");
        network.serve("https://app.test/index.html", 200, "shell");
        network.serve("https://app.test/style.css", 200, "css");

        let storage = Arc::new(MemoryCacheStorage::new());
        let config = WorkerConfig {
            cache_name: "v3".into(),
            assets: vec!["./".into(), "./index.html".into(), "./style.css".into()],
            ..Default::default()
        };
        let controller = AssetCacheController::new(
            config,
            Url::parse("https://app.test/sw.js").unwrap(),
            storage.clone(),
            network,
        )
        .unwrap();
        controller.on_install().await.unwrap();
        (controller, storage)
    }

    async fn ask(controller: &AssetCacheController, data: serde_json::Value) -> Option<serde_json::Value> {
        let MessageChannel { mut port1, port2 } = MessageChannel::new();
        controller
            .on_control_message(WorkerMessage::with_ports(data, vec![port2]))
            .await;
        port1.recv().await.map(|m| m.data)
    }

    #[tokio::test]
    async fn test_get_cache_contents() {
        let (controller, _) = seeded().await;

        let reply = ask(&controller, json!("GET_CACHE_CONTENTS")).await.unwrap();
        assert_eq!(
            reply,
            json!([
                "https://app.test/",
                "https://app.test/index.html",
                "https://app.test/style.css"
            ])
        );
    }

    #[tokio::test]
    async fn test_clear_cache_then_list() {
        let (controller, storage) = seeded().await;

        assert_eq!(ask(&controller, json!("CLEAR_CACHE")).await, Some(json!(true)));
        assert!(!storage.has("v3").await);
        assert_eq!(ask(&controller, json!("CLEAR_CACHE")).await, Some(json!(false)));

        // listing recreates an empty generation
        assert_eq!(ask(&controller, json!("GET_CACHE_CONTENTS")).await, Some(json!([])));
        assert!(storage.has("v3").await);
    }

    #[tokio::test]
    async fn test_unknown_command_gets_no_reply() {
        let (controller, _) = seeded().await;

        assert_eq!(ask(&controller, json!("SKIP_WAITING")).await, None);
        assert_eq!(ask(&controller, json!(42)).await, None);
    }

    #[tokio::test]
    async fn test_missing_port_is_ignored() {
        let (controller, _) = seeded().await;

        let handled = controller
            .on_control_message(WorkerMessage::new(json!("CLEAR_CACHE")))
            .await;
        assert_eq!(handled, None);
    }

    #[tokio::test]
    async fn test_reply_to_vanished_requester() {
        let (controller, _) = seeded().await;
        let MessageChannel { port1, port2 } = MessageChannel::new();
        drop(port1);

        let handled = controller
            .on_control_message(WorkerMessage::with_ports(json!("GET_CACHE_CONTENTS"), vec![port2]))
            .await;
        assert_eq!(handled, Some(ControlCommand::GetCacheContents));
    }
}
