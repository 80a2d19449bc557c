//! Notification dispatcher
//!
//! Forwards the open message to mentioned collaborators as one outbound
//! message carrying the latest comment and the thread marker.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::auth::TokenBroker;
use crate::thread::{extract_marker, marker_for, MARKER_PREFIX};
use crate::types::error::{NotesError, Result};
use crate::types::{Audience, MailItem, ThreadKey};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMailRequest {
    message: OutboundMessage,
    save_to_sent_items: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundMessage {
    subject: String,
    body: ItemBody,
    to_recipients: Vec<Recipient>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemBody {
    content_type: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: EmailAddress,
}

#[derive(Debug, Serialize)]
struct EmailAddress {
    address: String,
}

/// Sends mention notifications through the collaboration API
pub struct NotificationDispatcher {
    client: reqwest::Client,
    broker: Arc<TokenBroker>,
    send_url: String,
}

impl NotificationDispatcher {
    pub fn new(graph_base_url: &str, broker: Arc<TokenBroker>) -> Self {
        Self {
            client: reqwest::Client::new(),
            broker,
            send_url: format!("{}/me/sendMail", graph_base_url.trim_end_matches('/')),
        }
    }

    /// Forward the original message to the given recipients
    ///
    /// Recipients are deduplicated case-insensitively and receive a single
    /// message. Returns the addresses the message went to. Send failures are
    /// reported, never retried.
    pub async fn forward(
        &self,
        original: &MailItem,
        recipients: &[String],
        key: &ThreadKey,
        latest_comment: &str,
    ) -> Result<Vec<String>> {
        let recipients = dedupe_recipients(recipients);
        if recipients.is_empty() {
            debug!("No recipients to notify");
            return Ok(recipients);
        }

        let token = self.broker.acquire(Audience::Collaboration).await?;

        let request = SendMailRequest {
            message: OutboundMessage {
                subject: notification_subject(original),
                body: ItemBody {
                    content_type: "HTML",
                    content: compose_body(original, key, latest_comment),
                },
                to_recipients: recipients
                    .iter()
                    .map(|address| Recipient {
                        email_address: EmailAddress {
                            address: address.clone(),
                        },
                    })
                    .collect(),
            },
            save_to_sent_items: true,
        };

        let response = self
            .client
            .post(&self.send_url)
            .header(reqwest::header::AUTHORIZATION, token.bearer())
            .json(&request)
            .send()
            .await
            .map_err(|e| NotesError::Notification(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!("Notification send failed: {} {}", status, error_text);
            return Err(NotesError::Notification(format!(
                "{}: {}",
                status, error_text
            )));
        }

        info!("Notified {} mentioned recipients", recipients.len());
        Ok(recipients)
    }
}

fn notification_subject(original: &MailItem) -> String {
    if original.subject.trim().is_empty() {
        "You were mentioned in a comment".to_string()
    } else {
        format!("You were mentioned in a comment: {}", original.subject)
    }
}

/// Build the HTML body: marker, context, latest comment, then the original body
///
/// The marker is injected only when the original body carries none. Marker
/// text typed into the comment or context is defused so the first marker
/// in the body is always the thread's own.
pub fn compose_body(original: &MailItem, key: &ThreadKey, latest_comment: &str) -> String {
    let marker = if extract_marker(&original.body_html).is_none() {
        format!(
            "<p style=\"color:#999;font-size:9px\">{}</p>",
            marker_for(key)
        )
    } else {
        String::new()
    };

    format!(
        "{}<p>{} mentioned you in a comment on this email.</p>\
         <p><b>From:</b> {}<br><b>Subject:</b> {}</p>\
         <blockquote>{}</blockquote>\
         <hr />\
         {}",
        marker,
        escape_text(&original.user_display_name),
        escape_text(&original.sender),
        escape_text(&original.subject),
        escape_text(latest_comment),
        original.body_html,
    )
}

fn dedupe_recipients(recipients: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    recipients
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
        .filter(|r| seen.insert(r.to_lowercase()))
        .map(|r| r.to_string())
        .collect()
}

/// HTML-escape user text and defuse any marker inside it
fn escape_text(text: &str) -> String {
    let defused = format!("{}&#58;", MARKER_PREFIX.trim_end_matches(':'));
    escape_html(text).replace(MARKER_PREFIX, &defused)
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::testing::signed_in_broker;
    use crate::types::Platform;
    use httpmock::prelude::*;
    use serde_json::json;

    fn item(body: &str) -> MailItem {
        MailItem {
            body_html: body.to_string(),
            conversation_id: Some("conv-1".into()),
            subject: "Q3 numbers".into(),
            sender: "bob@contoso.com".into(),
            user_display_name: "Ann".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_body_embeds_original_and_marker() {
        let body = compose_body(&item("<div>original</div>"), &ThreadKey::new("conv-1"), "a < b");
        assert!(body.contains("<div>original</div>"));
        assert!(body.contains("a &lt; b"));
        assert!(body.contains("bob@contoso.com"));
        assert_eq!(extract_marker(&body), Some("conv-1"));
    }

    #[test]
    fn test_marker_not_duplicated() {
        let original = item("<p>CONVERSATION_ID:conv-1</p><div>original</div>");
        let body = compose_body(&original, &ThreadKey::new("conv-1"), "fyi");
        assert_eq!(body.matches("CONVERSATION_ID:").count(), 1);
    }

    #[test]
    fn test_typed_marker_cannot_redirect_thread() {
        let body = compose_body(
            &item("<div>original</div>"),
            &ThreadKey::new("conv-real"),
            "see CONVERSATION_ID:other for context",
        );
        assert_eq!(extract_marker(&body), Some("conv-real"));
        assert!(body.starts_with("<p style="));
        assert_eq!(body.matches("CONVERSATION_ID:").count(), 1);

        let mut original = item("<div>original</div>");
        original.subject = "CONVERSATION_ID:subject-key".into();
        let body = compose_body(&original, &ThreadKey::new("conv-real"), "ok");
        assert_eq!(extract_marker(&body), Some("conv-real"));
    }

    #[test]
    fn test_original_marker_wins_over_typed_marker() {
        let original = item("<p>CONVERSATION_ID:conv-1</p><div>original</div>");
        let body = compose_body(&original, &ThreadKey::new("conv-1"), "CONVERSATION_ID:other");
        assert_eq!(extract_marker(&body), Some("conv-1"));
        assert_eq!(body.matches("CONVERSATION_ID:").count(), 1);
        assert!(body.contains("CONVERSATION_ID&#58;other"));
    }

    #[test]
    fn test_dedupe_recipients() {
        let recipients = vec![
            "alice@x.com".to_string(),
            "ALICE@x.com".to_string(),
            " ".to_string(),
            "bob@x.com".to_string(),
        ];
        assert_eq!(dedupe_recipients(&recipients), vec!["alice@x.com", "bob@x.com"]);
    }

    #[tokio::test]
    async fn test_forward_sends_one_message() {
        let server = MockServer::start_async().await;
        let send = server.mock(|when, then| {
            when.method(POST)
                .path("/v1.0/me/sendMail")
                .header_exists("authorization")
                .json_body_partial(
                    json!({
                        "message": {
                            "toRecipients": [{ "emailAddress": { "address": "alice@x.com" } }]
                        },
                        "saveToSentItems": true
                    })
                    .to_string(),
                )
                .body_contains("CONVERSATION_ID:conv-1");
            then.status(202);
        });

        let dispatcher =
            NotificationDispatcher::new(&server.url("/v1.0"), signed_in_broker(Platform::Web));
        let sent = dispatcher
            .forward(
                &item("<div>original</div>"),
                &["alice@x.com".to_string(), "Alice@x.com".to_string()],
                &ThreadKey::new("conv-1"),
                "check this",
            )
            .await
            .unwrap();
        send.assert_hits(1);
        assert_eq!(sent, vec!["alice@x.com"]);
    }

    #[tokio::test]
    async fn test_forward_failure_is_notification_error() {
        let server = MockServer::start_async().await;
        let send = server.mock(|when, then| {
            when.method(POST).path("/v1.0/me/sendMail");
            then.status(403).body("denied");
        });

        let dispatcher =
            NotificationDispatcher::new(&server.url("/v1.0"), signed_in_broker(Platform::Web));
        let err = dispatcher
            .forward(&item(""), &["alice@x.com".to_string()], &ThreadKey::new("k"), "x")
            .await
            .unwrap_err();
        assert!(matches!(err, NotesError::Notification(msg) if msg.contains("403")));
        // Not retried
        send.assert_hits(1);
    }

    #[tokio::test]
    async fn test_no_recipients_no_call() {
        let server = MockServer::start_async().await;
        let send = server.mock(|when, then| {
            when.path("/v1.0/me/sendMail");
            then.status(202);
        });

        let dispatcher =
            NotificationDispatcher::new(&server.url("/v1.0"), signed_in_broker(Platform::Web));
        let sent = dispatcher
            .forward(&item(""), &[], &ThreadKey::new("k"), "x")
            .await
            .unwrap();
        assert!(sent.is_empty());
        send.assert_hits(0);
    }
}
