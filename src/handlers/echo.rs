//! The echo handler: replies with the trigger content verbatim.
//!
//! Exists for wiring checks and tests; an echo agent on the bus proves the
//! whole poll → claim → reply → thread pipeline without any model behind it.

use super::{Handler, HandlerError, HandlerMessage};
use async_trait::async_trait;

/// Replies with the trigger content, unchanged.
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(
        &self,
        trigger: &HandlerMessage,
        _batch: &[HandlerMessage],
        _history: &[HandlerMessage],
    ) -> Result<Option<String>, HandlerError> {
        Ok(Some(trigger.content.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_the_trigger_verbatim() {
        let trigger = HandlerMessage {
            id: "m1".to_string(),
            sender: "bob".to_string(),
            content: "@alpha hello there".to_string(),
        };
        let reply = EchoHandler.handle(&trigger, &[], &[]).await.unwrap();
        assert_eq!(reply.as_deref(), Some("@alpha hello there"));
    }
}
