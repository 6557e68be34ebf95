//! WhatsApp messaging gateway adapter.
//!
//! Two halves. The inbound half normalizes the gateway's webhook envelope
//! into [`InboundEvent`] — flattening structured message ids, mapping event
//! kinds, carrying quoted references and media — so the engine never sees
//! the wire format. The outbound half implements [`ChannelTransport`] over
//! the Cloud-API-style send endpoint.

use async_trait::async_trait;
use serde_json::Value;

use super::traits::{ChannelTransport, LabelClient, PresenceKind};
use crate::config::WhatsAppConfig;
use crate::engine::event::{
    normalize_message_id, EventKind, InboundEvent, MediaRef, QuotedRef,
};
use crate::util::now_ms;

fn ensure_https(url: &str) -> anyhow::Result<()> {
    // Loopback gateways (self-hosted bridges) are exempt from the TLS
    // requirement; everything else must be https.
    let loopback = url.starts_with("http://127.0.0.1")
        || url.starts_with("http://localhost")
        || url.starts_with("http://[::1]");
    if !url.starts_with("https://") && !loopback {
        anyhow::bail!("Refusing to transmit credentials over non-HTTPS URL");
    }
    Ok(())
}

pub struct WhatsAppTransport {
    cfg: WhatsAppConfig,
    client: reqwest::Client,
}

impl WhatsAppTransport {
    pub fn new(cfg: WhatsAppConfig) -> Self {
        Self {
            cfg,
            client: reqwest::Client::new(),
        }
    }

    /// Token echoed back during webhook subscription verification.
    pub fn verify_token(&self) -> &str {
        &self.cfg.verify_token
    }

    /// Check if a phone number is allowed (E.164 format: +1234567890).
    pub fn is_number_allowed(&self, phone: &str) -> bool {
        self.cfg
            .allowed_numbers
            .iter()
            .any(|n| n == "*" || n == phone)
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/messages",
            self.cfg.api_url.trim_end_matches('/'),
            self.cfg.phone_number_id
        )
    }

    async fn post_message(&self, body: Value) -> anyhow::Result<Option<String>> {
        let url = self.messages_url();
        ensure_https(&url)?;

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.cfg.access_token)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            tracing::error!("WhatsApp send failed: {status}");
            anyhow::bail!("WhatsApp API error: {status}");
        }

        let parsed: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(parsed
            .get("messages")
            .and_then(|m| m.as_array())
            .and_then(|arr| arr.first())
            .and_then(|m| m.get("id"))
            .and_then(|id| id.as_str())
            .map(ToString::to_string))
    }
}

#[async_trait]
impl ChannelTransport for WhatsAppTransport {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send_text(
        &self,
        _channel_id: &str,
        recipient_id: &str,
        text: &str,
    ) -> anyhow::Result<Option<String>> {
        let to = recipient_id.strip_prefix('+').unwrap_or(recipient_id);
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": text }
        }))
        .await
    }

    async fn send_media(
        &self,
        _channel_id: &str,
        recipient_id: &str,
        url: &str,
        caption: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        let to = recipient_id.strip_prefix('+').unwrap_or(recipient_id);
        let mut image = serde_json::json!({ "link": url });
        if let Some(caption) = caption {
            image["caption"] = Value::String(caption.to_string());
        }
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "image",
            "image": image
        }))
        .await
    }

    async fn send_presence(
        &self,
        _channel_id: &str,
        _recipient_id: &str,
        _kind: PresenceKind,
    ) -> anyhow::Result<()> {
        // The Cloud API exposes no presence endpoint; best-effort no-op.
        Ok(())
    }
}

#[async_trait]
impl LabelClient for WhatsAppTransport {
    async fn get_labels(
        &self,
        _channel_id: &str,
        _participant_id: &str,
    ) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn apply_label(
        &self,
        channel_id: &str,
        participant_id: &str,
        name: &str,
    ) -> anyhow::Result<()> {
        tracing::info!(channel = %channel_id, participant = %participant_id, label = %name, "label assignment requested");
        Ok(())
    }
}

// ── Webhook normalization ─────────────────────────────────────────

/// Normalize one webhook envelope `{event, channelId, payload}` into an
/// [`InboundEvent`]. Returns `None` when the envelope is not something the
/// engine consumes (unknown kind, no payload).
pub fn normalize_event(raw: &Value) -> Option<InboundEvent> {
    let channel_id = raw
        .get("channelId")
        .or_else(|| raw.get("session"))
        .and_then(Value::as_str)?
        .to_string();
    let kind_raw = raw.get("event").and_then(Value::as_str).unwrap_or("message");
    let payload = raw.get("payload")?;

    let kind = match kind_raw {
        "message" | "onmessage" => EventKind::Message,
        "stateChange" | "state_change" | "onstatechange" => {
            let status = payload
                .get("state")
                .or_else(|| payload.get("status"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            EventKind::StateChange(status)
        }
        "labelApplied" | "label_applied" | "onlabel" => {
            let label = payload
                .get("label")
                .and_then(|l| l.get("name").or(Some(l)))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            EventKind::LabelApplied(label)
        }
        _ => return None,
    };

    if !matches!(kind, EventKind::Message) {
        // Label events name a participant on gateways that scope labels to
        // a chat; state changes are channel-wide.
        let participant = payload
            .get("participant")
            .or_else(|| payload.get("from"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Some(InboundEvent {
            channel_id,
            kind,
            message_id: String::new(),
            from_id: participant,
            to_id: String::new(),
            body: String::new(),
            media_refs: Vec::new(),
            is_outbound_echo: false,
            timestamp_secs: now_ms() / 1000,
            quoted: None,
            push_name: None,
        });
    }

    let message_id = payload.get("id").and_then(normalize_message_id)?;
    let from_id = payload.get("from").and_then(Value::as_str)?.to_string();
    let to_id = payload
        .get("to")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let body = payload
        .get("body")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let is_outbound_echo = payload
        .get("fromMe")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let timestamp_secs = payload
        .get("timestamp")
        .and_then(parse_timestamp)
        .unwrap_or_else(|| now_ms() / 1000);

    Some(InboundEvent {
        channel_id,
        kind,
        message_id,
        from_id,
        to_id,
        body,
        media_refs: parse_media(payload),
        is_outbound_echo,
        timestamp_secs,
        quoted: parse_quoted(payload),
        push_name: payload
            .get("pushName")
            .and_then(Value::as_str)
            .map(ToString::to_string),
    })
}

/// Timestamps arrive as epoch-second numbers or numeric strings.
fn parse_timestamp(raw: &Value) -> Option<i64> {
    match raw {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_media(payload: &Value) -> Vec<MediaRef> {
    let has_media = payload
        .get("hasMedia")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    if let Some(items) = payload.get("media").and_then(Value::as_array) {
        return items
            .iter()
            .filter_map(|item| {
                let url = item.get("url").and_then(Value::as_str)?;
                Some(MediaRef {
                    url: url.to_string(),
                    mime_type: item
                        .get("mimeType")
                        .or_else(|| item.get("mimetype"))
                        .and_then(Value::as_str)
                        .map(ToString::to_string),
                })
            })
            .collect();
    }

    if has_media {
        if let Some(url) = payload.get("mediaUrl").and_then(Value::as_str) {
            return vec![MediaRef {
                url: url.to_string(),
                mime_type: payload
                    .get("mimetype")
                    .and_then(Value::as_str)
                    .map(ToString::to_string),
            }];
        }
    }
    Vec::new()
}

fn parse_quoted(payload: &Value) -> Option<QuotedRef> {
    if let Some(quoted) = payload.get("quotedMsg") {
        let message_id = quoted.get("id").and_then(normalize_message_id);
        let body = quoted
            .get("body")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        if message_id.is_some() || body.is_some() {
            return Some(QuotedRef { message_id, body });
        }
    }
    if let Some(reply_to) = payload.get("replyTo").and_then(Value::as_str) {
        return Some(QuotedRef {
            message_id: Some(reply_to.to_string()),
            body: None,
        });
    }
    None
}
