/*!
Transactional notification email: validate the event payload, resolve
recipients, render a fixed HTML template, and hand the message to the
delivery provider over its REST API.

Dispatch is fire-and-forget relative to the business event that triggered
it; a failed send never rolls back or retries the originating action.
*/
use sqlx::PgPool;

use crate::{se, CONFIG, LOG};

/// Review outcome for a demo submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoStatus {
    Approved,
    Rejected,
    NeedsImprovement,
}

impl DemoStatus {
    pub const ALLOWED: &'static [&'static str] = &["approved", "rejected", "needs_improvement"];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(DemoStatus::Approved),
            "rejected" => Some(DemoStatus::Rejected),
            "needs_improvement" => Some(DemoStatus::NeedsImprovement),
            _ => None,
        }
    }

    /// Subject line, accent color, and badge glyph per outcome.
    pub fn theme(&self) -> StatusTheme {
        match self {
            DemoStatus::Approved => StatusTheme {
                subject: "Your demo has been approved",
                color: "#16a34a",
                badge: "&#10003;",
            },
            DemoStatus::Rejected => StatusTheme {
                subject: "An update on your demo submission",
                color: "#dc2626",
                badge: "&#10007;",
            },
            DemoStatus::NeedsImprovement => StatusTheme {
                subject: "Your demo needs another pass",
                color: "#d97706",
                badge: "&#9888;",
            },
        }
    }
}

pub struct StatusTheme {
    pub subject: &'static str,
    pub color: &'static str,
    pub badge: &'static str,
}

/// A validated notification event.
#[derive(Debug, PartialEq)]
pub enum Notification {
    NewArtist {
        artist_name: String,
        artist_email: String,
    },
    DemoStatus {
        artist_name: String,
        artist_email: String,
        track_title: String,
        status: DemoStatus,
        feedback: Option<String>,
    },
    Announcement {
        subject: String,
        message: String,
        recipient_email: Option<String>,
    },
}

fn required(v: &serde_json::Value, field: &str, problems: &mut Vec<String>) -> String {
    match v[field].as_str() {
        Some(s) if !s.trim().is_empty() => s.to_string(),
        Some(_) => {
            problems.push(format!("{} must be a non-empty string", field));
            String::new()
        }
        None => {
            problems.push(format!("{} is required", field));
            String::new()
        }
    }
}

fn optional(v: &serde_json::Value, field: &str) -> Option<String> {
    v[field].as_str().map(|s| s.to_string()).filter(|s| !s.trim().is_empty())
}

/// Validate an event payload against its schema, collecting every
/// offending field instead of stopping at the first.
pub fn parse_notification(
    v: &serde_json::Value,
) -> std::result::Result<Notification, Vec<String>> {
    let mut problems = vec![];
    let kind = required(v, "kind", &mut problems);
    if !problems.is_empty() {
        return Err(problems);
    }
    let parsed = match kind.as_str() {
        "new_artist" => {
            let artist_name = required(v, "artist_name", &mut problems);
            let artist_email = required(v, "artist_email", &mut problems);
            Notification::NewArtist {
                artist_name,
                artist_email,
            }
        }
        "demo_status" => {
            let artist_name = required(v, "artist_name", &mut problems);
            let artist_email = required(v, "artist_email", &mut problems);
            let track_title = required(v, "track_title", &mut problems);
            let status_raw = required(v, "status", &mut problems);
            let status = match DemoStatus::parse(&status_raw) {
                Some(s) => s,
                None => {
                    if !status_raw.is_empty() {
                        problems.push(format!(
                            "status must be one of {}",
                            DemoStatus::ALLOWED.join(", ")
                        ));
                    }
                    DemoStatus::Approved
                }
            };
            Notification::DemoStatus {
                artist_name,
                artist_email,
                track_title,
                status,
                feedback: optional(v, "feedback"),
            }
        }
        "announcement" => Notification::Announcement {
            subject: required(v, "subject", &mut problems),
            message: required(v, "message", &mut problems),
            recipient_email: optional(v, "recipient_email"),
        },
        other => {
            problems.push(format!(
                "kind must be one of new_artist, demo_status, announcement (got {})",
                other
            ));
            return Err(problems);
        }
    };
    if problems.is_empty() {
        Ok(parsed)
    } else {
        Err(problems)
    }
}

fn layout(accent: &str, heading: &str, body: &str) -> String {
    format!(
        r#"<div style="font-family:Helvetica,Arial,sans-serif;max-width:560px;margin:0 auto;padding:24px;">
  <div style="border-top:4px solid {accent};padding-top:16px;">
    <h2 style="margin:0 0 12px 0;color:#111827;">{heading}</h2>
    {body}
    <p style="color:#6b7280;font-size:12px;margin-top:24px;">Backline, the artist portal.</p>
  </div>
</div>"#,
        accent = accent,
        heading = heading,
        body = body,
    )
}

pub fn render_new_artist(artist_name: &str, artist_email: &str) -> String {
    layout(
        "#4f46e5",
        "New artist registration",
        &format!(
            r#"<p><strong>{}</strong> ({}) just registered on the portal.</p>
    <p>Review the profile from the admin dashboard.</p>"#,
            artist_name, artist_email
        ),
    )
}

pub fn render_demo_status(
    artist_name: &str,
    track_title: &str,
    status: DemoStatus,
    feedback: Option<&str>,
) -> String {
    let theme = status.theme();
    let feedback_block = match feedback {
        Some(f) => format!(
            r#"<p style="background:#f3f4f6;padding:12px;border-radius:4px;">{}</p>"#,
            f
        ),
        None => String::new(),
    };
    layout(
        theme.color,
        theme.subject,
        &format!(
            r#"<p>Hi {artist},</p>
    <p><span style="color:{color};font-size:18px;">{badge}</span> Your submission <strong>"{track}"</strong> has been reviewed.</p>
    {feedback}"#,
            artist = artist_name,
            color = theme.color,
            badge = theme.badge,
            track = track_title,
            feedback = feedback_block,
        ),
    )
}

pub fn render_announcement(subject: &str, message: &str) -> String {
    layout("#4f46e5", subject, &format!("<p>{}</p>", message))
}

#[derive(sqlx::FromRow, Debug)]
struct AdminEmail {
    email: String,
}

/// Emails of every profile holding the admin role.
pub async fn admin_emails(pool: &PgPool) -> crate::Result<Vec<String>> {
    let rows = sqlx::query_as::<_, AdminEmail>(
        "
        select p.email
        from profiles p
            inner join user_roles r on p.user_id = r.user_id
        where r.role = 'admin' and p.email is not null
        ",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| se!("error fetching admin emails {:?}", e))?;
    Ok(rows.into_iter().map(|r| r.email).collect())
}

/// An empty computed recipient list falls back to the configured
/// operator address so the event is never dropped silently.
pub fn recipients_or_fallback(found: Vec<String>, fallback: &str) -> Vec<String> {
    if found.is_empty() {
        vec![fallback.to_string()]
    } else {
        found
    }
}

#[derive(serde::Serialize)]
struct OutboundEmail<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    html: &'a str,
}

#[derive(serde::Deserialize)]
struct ProviderReceipt {
    id: String,
}

/// Submit one rendered message to the delivery provider. Returns the
/// provider's message id.
pub async fn deliver(to: &[String], subject: &str, html: &str) -> crate::Result<String> {
    let api_key = CONFIG
        .email_api_key
        .as_ref()
        .ok_or_else(|| se!("missing configuration EMAIL_API_KEY"))?;
    let outbound = OutboundEmail {
        from: &CONFIG.email_from,
        to,
        subject,
        html,
    };
    let mut resp = surf::post(&CONFIG.email_api_url)
        .header("authorization", format!("Bearer {}", api_key))
        .body(surf::Body::from_json(&outbound).map_err(|e| se!("email json error {}", e))?)
        .send()
        .await
        .map_err(|e| se!("email provider request error {:?}", e))?;
    let status = resp.status();
    let body = resp
        .body_string()
        .await
        .map_err(|e| se!("email provider read error {:?}", e))?;
    if !status.is_success() {
        slog::error!(
            LOG, "email provider rejected message";
            "status" => u16::from(status),
            "body" => &body,
        );
        return Err(se!("email provider returned {}: {}", status, body).into());
    }
    let receipt: ProviderReceipt = serde_json::from_str(&body)
        .map_err(|e| se!("email provider receipt parse error {}", e))?;
    slog::info!(
        LOG, "notification sent";
        "email_id" => &receipt.id,
        "recipients" => to.len(),
    );
    Ok(receipt.id)
}

/// Resolve recipients, render, and send a validated notification.
pub async fn dispatch(pool: &PgPool, notification: &Notification) -> crate::Result<String> {
    match notification {
        Notification::NewArtist {
            artist_name,
            artist_email,
        } => {
            let admins = admin_emails(pool).await?;
            let to = recipients_or_fallback(admins, &CONFIG.notify_fallback_email);
            let subject = format!("New artist registration: {}", artist_name);
            let html = render_new_artist(artist_name, artist_email);
            deliver(&to, &subject, &html).await
        }
        Notification::DemoStatus {
            artist_name,
            artist_email,
            track_title,
            status,
            feedback,
        } => {
            let to = vec![artist_email.clone()];
            let theme = status.theme();
            let html =
                render_demo_status(artist_name, track_title, *status, feedback.as_deref());
            deliver(&to, theme.subject, &html).await
        }
        Notification::Announcement {
            subject,
            message,
            recipient_email,
        } => {
            let to = match recipient_email {
                Some(email) => vec![email.clone()],
                None => {
                    let admins = admin_emails(pool).await?;
                    recipients_or_fallback(admins, &CONFIG.notify_fallback_email)
                }
            };
            let html = render_announcement(subject, message);
            deliver(&to, subject, &html).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_demo_status_payload_parses() {
        let v = serde_json::json!({
            "kind": "demo_status",
            "artist_name": "Ayra",
            "artist_email": "ayra@example.com",
            "track_title": "Night Drive",
            "status": "approved",
            "feedback": "Great energy on the hook."
        });
        let parsed = parse_notification(&v).unwrap();
        match parsed {
            Notification::DemoStatus {
                status, feedback, ..
            } => {
                assert_eq!(status, DemoStatus::Approved);
                assert_eq!(feedback.as_deref(), Some("Great energy on the hook."));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn status_outside_enum_is_rejected_with_field_detail() {
        let v = serde_json::json!({
            "kind": "demo_status",
            "artist_name": "Ayra",
            "artist_email": "ayra@example.com",
            "track_title": "Night Drive",
            "status": "maybe"
        });
        let problems = parse_notification(&v).unwrap_err();
        assert!(problems
            .iter()
            .any(|p| p.contains("status must be one of")));
    }

    #[test]
    fn missing_fields_are_all_reported() {
        let v = serde_json::json!({ "kind": "demo_status" });
        let problems = parse_notification(&v).unwrap_err();
        assert!(problems.iter().any(|p| p == "artist_name is required"));
        assert!(problems.iter().any(|p| p == "artist_email is required"));
        assert!(problems.iter().any(|p| p == "track_title is required"));
        assert!(problems.iter().any(|p| p == "status is required"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let v = serde_json::json!({ "kind": "party_invite" });
        let problems = parse_notification(&v).unwrap_err();
        assert!(problems[0].contains("kind must be one of"));
    }

    #[test]
    fn announcement_recipient_is_optional() {
        let v = serde_json::json!({
            "kind": "announcement",
            "subject": "Portal maintenance",
            "message": "Down Saturday 02:00-03:00 UTC."
        });
        match parse_notification(&v).unwrap() {
            Notification::Announcement {
                recipient_email, ..
            } => assert!(recipient_email.is_none()),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn empty_admin_list_falls_back_to_operator_address() {
        let to = recipients_or_fallback(vec![], "label-ops@backline.dev");
        assert_eq!(to, vec!["label-ops@backline.dev".to_string()]);

        let to = recipients_or_fallback(vec!["a@b.c".to_string()], "label-ops@backline.dev");
        assert_eq!(to, vec!["a@b.c".to_string()]);
    }

    #[test]
    fn status_theme_lookup() {
        assert_eq!(DemoStatus::Approved.theme().color, "#16a34a");
        assert_eq!(DemoStatus::Rejected.theme().color, "#dc2626");
        assert_eq!(DemoStatus::NeedsImprovement.theme().color, "#d97706");
    }

    #[test]
    fn demo_status_render_carries_theme_and_fields() {
        let html = render_demo_status("Ayra", "Night Drive", DemoStatus::Approved, None);
        assert!(html.contains("#16a34a"));
        assert!(html.contains("Night Drive"));
        assert!(html.contains("Ayra"));
        // no feedback block when none was given
        assert!(!html.contains("background:#f3f4f6"));
    }
}
