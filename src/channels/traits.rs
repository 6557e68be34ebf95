use async_trait::async_trait;

/// Typing/read indicators the transport can surface to the participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    Typing,
    Seen,
}

/// Outbound side of a messaging gateway.
///
/// Fire-and-forget from the engine's perspective: a failed send is logged
/// and audited, never retried within the turn.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Human-readable transport name, used in logs.
    fn name(&self) -> &str;

    /// Send a text message. Returns the gateway-assigned message id when
    /// the gateway reports one, so the echo registry can match on it.
    async fn send_text(
        &self,
        channel_id: &str,
        recipient_id: &str,
        text: &str,
    ) -> anyhow::Result<Option<String>>;

    /// Send a media attachment with an optional caption.
    async fn send_media(
        &self,
        channel_id: &str,
        recipient_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> anyhow::Result<Option<String>>;

    /// Surface a typing/seen indicator. Best-effort.
    async fn send_presence(
        &self,
        _channel_id: &str,
        _recipient_id: &str,
        _kind: PresenceKind,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Conversation labels maintained on the gateway side.
#[async_trait]
pub trait LabelClient: Send + Sync {
    async fn get_labels(&self, channel_id: &str, participant_id: &str)
        -> anyhow::Result<Vec<String>>;

    async fn apply_label(
        &self,
        channel_id: &str,
        participant_id: &str,
        name: &str,
    ) -> anyhow::Result<()>;
}

/// No-op label client for gateways without label support.
pub struct NullLabelClient;

#[async_trait]
impl LabelClient for NullLabelClient {
    async fn get_labels(
        &self,
        _channel_id: &str,
        _participant_id: &str,
    ) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn apply_label(
        &self,
        _channel_id: &str,
        _participant_id: &str,
        _name: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
