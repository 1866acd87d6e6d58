//! Inbound frame dispatch
//!
//! Every frame is size-checked and decoded. PING and PONG are answered before
//! anything else. All other frames must name this socket's user and one of the
//! user's live connections, and every action except SUBSCRIBE requires the
//! socket to be subscribed to the frame's topic.

use super::connection::Connection;
use crate::core::frame::check_frame_len;
use crate::core::topic::validate_topic;
use crate::core::{
    ExchangeTopic, FrameRef, SockError, SocketAction, SocketMessage, Targets,
};
use crate::registry::Frame;
use crate::server::host::{encode_frame, json_frame};
use serde::Deserialize;

/// LOAD_MESSAGES payload
#[derive(Debug, Deserialize)]
struct PageRequest {
    #[serde(default = "first_page")]
    page: i64,
    #[serde(rename = "pageSize", default)]
    page_size: Option<i64>,
}

fn first_page() -> i64 {
    1
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: first_page(),
            page_size: None,
        }
    }
}

impl Connection {
    pub(super) async fn handle_frame(&mut self, raw: &[u8]) -> Result<(), SockError> {
        check_frame_len(raw, self.host.config.max_frame_bytes)?;
        let frame = FrameRef::decode(raw)?;

        match frame.action {
            SocketAction::PingChannel => {
                return self.reply(&SocketMessage::new(SocketAction::Pong, frame.topic));
            }
            SocketAction::Pong => return Ok(()),
            _ => {}
        }

        self.authorize_sender(&frame).await?;
        if frame.action.is_server_only() {
            return Err(SockError::Input(format!("{} is server-only", frame.action)));
        }

        let topic = frame.topic;
        validate_topic(topic)?;

        if frame.action != SocketAction::Subscribe
            && !self
                .host
                .registry
                .has_subscribed_topic(&self.session.sub, topic, Some(&self.connection_id))
                .await?
        {
            return Err(SockError::Auth(format!("not subscribed to {}", topic)));
        }

        match frame.action {
            SocketAction::Subscribe => self.subscribe(topic).await,
            SocketAction::Unsubscribe => self.unsubscribe(topic).await,
            SocketAction::LoadSubscribers => self.load_subscribers(topic).await,
            SocketAction::LoadMessages => self.load_messages(topic, frame.payload).await,
            action if action.is_store_class() => self.store_and_fan_out(topic, raw).await,
            _ => {
                self.host.fan_out(topic, Frame::from(raw)).await?;
                Ok(())
            }
        }
    }

    async fn authorize_sender(&self, frame: &FrameRef<'_>) -> Result<(), SockError> {
        if frame.sender_user != self.session.sub {
            return Err(SockError::Auth("sender user mismatch".into()));
        }
        if frame.sender_connection == self.connection_id {
            return Ok(());
        }
        let live = self
            .host
            .registry
            .get_subscribed_targets(&self.session.sub)
            .await?;
        if !live.contains(frame.sender_connection) {
            return Err(SockError::Auth("sender connection mismatch".into()));
        }
        Ok(())
    }

    /// Bookable exchange topics only, and only for the booking's two parties
    async fn allowed(&self, topic: &str) -> Result<bool, SockError> {
        let Some(booking_id) = ExchangeTopic::parse(topic).and_then(|t| t.booking_id()) else {
            return Ok(false);
        };
        Ok(self.host.store.allowed(&self.session, booking_id).await?)
    }

    async fn is_tracked(&self, topic: &str, default: bool) -> bool {
        match self.host.cache.has_tracking(topic, &self.socket_id).await {
            Ok(tracked) => tracked,
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "tracking state unknown");
                default
            }
        }
    }

    async fn subscribe(&self, topic: &str) -> Result<(), SockError> {
        if self.is_tracked(topic, false).await {
            let participants = self.host.load_participants(&self.session, topic).await;
            return self.reply_json(SocketAction::Subscribe, topic, &participants);
        }

        if !self.allowed(topic).await? {
            return Err(SockError::Auth(format!("topic {} denied", topic)));
        }

        self.host
            .registry
            .add_subscribed_topic(
                &self.session.sub,
                topic,
                &Targets::single(self.connection_id.clone()),
            )
            .await?;
        if let Err(e) = self.host.cache.track(topic, &self.socket_id).await {
            tracing::warn!(
                topic = %topic,
                socket_id = %self.socket_id,
                error = %e,
                "failed to track"
            );
        }
        tracing::debug!(topic = %topic, socket_id = %self.socket_id, "subscribed");

        let participants = self.host.load_participants(&self.session, topic).await;
        self.reply_json(SocketAction::Subscribe, topic, &participants)?;

        let snapshot = json_frame(SocketAction::LoadSubscribers, topic, &participants)?;
        self.host.fan_out(topic, snapshot).await?;
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), SockError> {
        // when the cache cannot answer, unsubscribe anyway
        if !self.is_tracked(topic, true).await {
            return Ok(());
        }

        let (mut targets, _) = self.host.topic_targets(topic).await?;
        let notice = SocketMessage::new(SocketAction::UnsubscribeTopic, topic)
            .with_payload(self.socket_id.to_string());
        self.host
            .deliver(topic, &targets, encode_frame(&notice)?)
            .await?;

        if let Err(e) = self.host.cache.untrack(&self.socket_id, topic).await {
            tracing::warn!(
                topic = %topic,
                socket_id = %self.socket_id,
                error = %e,
                "failed to untrack"
            );
        }
        self.host
            .registry
            .delete_subscribed_topic(&self.session.sub, topic, Some(&self.connection_id))
            .await?;
        tracing::debug!(topic = %topic, socket_id = %self.socket_id, "unsubscribed");

        targets.remove(&self.connection_id);
        self.host
            .push_participants(&self.session, topic, &targets)
            .await?;
        Ok(())
    }

    async fn load_subscribers(&self, topic: &str) -> Result<(), SockError> {
        let participants = self.host.load_participants(&self.session, topic).await;
        self.reply_json(SocketAction::LoadSubscribers, topic, &participants)
    }

    async fn load_messages(&self, topic: &str, payload: &[u8]) -> Result<(), SockError> {
        let request = if payload.is_empty() {
            PageRequest::default()
        } else {
            match serde_json::from_slice::<PageRequest>(payload) {
                Ok(request) => request,
                Err(e) => {
                    let error = SockError::Input(format!("bad page request: {e}"));
                    self.reply_error(topic, &error)?;
                    return Err(error);
                }
            }
        };

        let config = &self.host.config;
        let page_size = config.clamp_page_size(request.page_size.unwrap_or(config.max_page_size));

        match self
            .host
            .store
            .load_page(&self.session, topic, request.page, page_size)
            .await
        {
            Ok(frames) => {
                for frame in frames {
                    self.send(Frame::from(frame));
                }
                Ok(())
            }
            Err(e) => {
                let error = SockError::from(e);
                self.reply_error(topic, &error)?;
                Err(error)
            }
        }
    }

    async fn store_and_fan_out(&self, topic: &str, raw: &[u8]) -> Result<(), SockError> {
        if let Err(e) = self
            .host
            .store
            .append(&self.session, &self.connection_id, topic, raw)
            .await
        {
            let error = SockError::from(e);
            self.reply_error(topic, &error)?;
            return Err(error);
        }
        self.host.fan_out(topic, Frame::from(raw)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_request_defaults() {
        let request: PageRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(request.page, 1);
        assert_eq!(request.page_size, None);

        let request: PageRequest = serde_json::from_str(r#"{"page":2,"pageSize":10}"#).unwrap();
        assert_eq!(request.page, 2);
        assert_eq!(request.page_size, Some(10));
    }
}
