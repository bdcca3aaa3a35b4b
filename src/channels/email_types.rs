//! Email-specific types and parsing: inbound mail, lead notifications,
//! reply cleaning, and subject normalization.
//!
//! Pure string parsing, no I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channels::transport::NewLead;
use crate::error::TransportError;

/// Subject prefix of web-form lead notifications.
pub const LEAD_SUBJECT_PREFIX: &str = "New Prospect Notification";

/// One message pulled from the mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEmail {
    /// Message-ID header, or a generated id when missing.
    pub message_id: String,
    /// Sender address.
    pub sender: String,
    pub subject: String,
    /// Readable body text (HTML stripped).
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl InboundEmail {
    pub fn is_lead_notification(&self) -> bool {
        is_lead_notification(&self.subject)
    }
}

/// Lead notifications start with the form prefix and are not replies.
pub fn is_lead_notification(subject: &str) -> bool {
    let subject = subject.trim();
    subject.starts_with(LEAD_SUBJECT_PREFIX) && !has_prefix_ci(subject, "re:")
}

/// Extract a lead from a notification email.
///
/// Reads `Name:`, `Email:` and `Phone:` lines. The first word of the name
/// is the first name; the location is whatever follows " - " in the
/// subject. A missing name or email is an error.
pub fn parse_lead_notification(
    body: &str,
    subject: &str,
    received_at: DateTime<Utc>,
) -> Result<NewLead, TransportError> {
    let mut name = None;
    let mut email = None;
    let mut phone = None;

    for line in body.lines() {
        let line = line.trim();
        if let Some(v) = field_value(line, "name:") {
            name = Some(v);
        } else if let Some(v) = field_value(line, "email:") {
            email = Some(bare_address(v));
        } else if let Some(v) = field_value(line, "phone:") {
            phone = Some(v.to_string());
        }
    }

    let email = email
        .filter(|e| e.contains('@'))
        .ok_or_else(|| TransportError::InvalidMessage(format!("no email in lead '{subject}'")))?;
    let first_name = name
        .and_then(|n| n.split_whitespace().next())
        .map(String::from)
        .ok_or_else(|| TransportError::InvalidMessage(format!("no name in lead '{subject}'")))?;

    let location = subject
        .split_once(" - ")
        .map(|(_, loc)| loc.trim().to_string())
        .filter(|loc| !loc.is_empty());

    Ok(NewLead {
        email,
        first_name,
        phone,
        thread_subject: subject.trim().to_string(),
        location,
        received_at,
    })
}

/// `"Name: Jo"` → `Some("Jo")`, case-insensitive on the label.
fn field_value<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    if !has_prefix_ci(line, label) {
        return None;
    }
    let value = line[label.len()..].trim();
    (!value.is_empty()).then_some(value)
}

/// `"Jo <jo@x.com>"` or `"mailto:jo@x.com"` → `"jo@x.com"`.
fn bare_address(raw: &str) -> String {
    let raw = match (raw.find('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if end > start => &raw[start + 1..end],
        _ => raw,
    };
    raw.trim().trim_start_matches("mailto:").to_lowercase()
}

/// Lines that begin the quoted part of a reply.
const REPLY_MARKERS: &[&str] = &[
    "On ",
    "-----Original Message-----",
    "________________________________",
    "From:",
    "Sent:",
    "> ",
];

/// Keep only what the prospect typed.
///
/// Stops at the first reply marker and skips quoted and blank lines. If
/// nothing survives, the trimmed original is returned.
pub fn clean_reply_content(body: &str) -> String {
    let mut kept = Vec::new();
    for line in body.lines() {
        if REPLY_MARKERS.iter().any(|m| line.trim_start().starts_with(m)) {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('>') {
            continue;
        }
        kept.push(trimmed);
    }

    if kept.is_empty() {
        body.trim().to_string()
    } else {
        kept.join("\n")
    }
}

/// Strip any run of `Re:` / `Fwd:` / `Fw:` prefixes, case-insensitively.
pub fn core_subject(subject: &str) -> &str {
    let mut s = subject.trim();
    loop {
        let stripped = ["re:", "fwd:", "fw:"]
            .iter()
            .find(|p| has_prefix_ci(s, p))
            .map(|p| s[p.len()..].trim_start());
        match stripped {
            Some(rest) => s = rest,
            None => return s,
        }
    }
}

/// Subject for our message on a thread.
pub fn reply_subject(thread_subject: &str) -> String {
    format!("Re: {}", core_subject(thread_subject))
}

fn has_prefix_ci(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len()
        && s.is_char_boundary(prefix.len())
        && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFICATION: &str = "You have a new lead!\n\nName: Jordan Lee\nEmail: Jordan@Example.com\nPhone: 555-0100\n\nReply within 24 hours.";

    #[test]
    fn lead_notification_parsed() {
        let at = Utc::now();
        let lead =
            parse_lead_notification(NOTIFICATION, "New Prospect Notification - Downtown", at)
                .unwrap();
        assert_eq!(lead.first_name, "Jordan");
        assert_eq!(lead.email, "jordan@example.com");
        assert_eq!(lead.phone.as_deref(), Some("555-0100"));
        assert_eq!(lead.location.as_deref(), Some("Downtown"));
        assert_eq!(lead.thread_subject, "New Prospect Notification - Downtown");
        assert_eq!(lead.received_at, at);
    }

    #[test]
    fn lead_without_phone_or_location() {
        let lead = parse_lead_notification(
            "name: sam\nemail: <sam@example.com>\nPhone:",
            "New Prospect Notification",
            Utc::now(),
        )
        .unwrap();
        assert_eq!(lead.first_name, "sam");
        assert_eq!(lead.email, "sam@example.com");
        assert!(lead.phone.is_none());
        assert!(lead.location.is_none());
    }

    #[test]
    fn lead_missing_fields_is_invalid() {
        for body in ["Name: Jo", "Email: jo@example.com", "Email: not-an-address\nName: Jo"] {
            let err = parse_lead_notification(body, "New Prospect Notification", Utc::now());
            assert!(matches!(err, Err(TransportError::InvalidMessage(_))), "{body}");
        }
    }

    #[test]
    fn lead_subject_detection() {
        assert!(is_lead_notification("New Prospect Notification - Downtown"));
        assert!(!is_lead_notification("Re: New Prospect Notification - Downtown"));
        assert!(!is_lead_notification("Your order has shipped"));
    }

    #[test]
    fn reply_stops_at_attribution() {
        let body = "Tuesday evening works!\n\nOn Mon, Mar 3, 2025 at 9:00 AM Gym <gym@ex.com> wrote:\n> Hi Jordan";
        assert_eq!(clean_reply_content(body), "Tuesday evening works!");
    }

    #[test]
    fn reply_stops_at_outlook_separators() {
        assert_eq!(
            clean_reply_content("Sounds good\n-----Original Message-----\nFrom: gym"),
            "Sounds good"
        );
        assert_eq!(
            clean_reply_content("Yes\n________________________________\nFrom: gym\nSent: today"),
            "Yes"
        );
        assert_eq!(clean_reply_content("Ok\nFrom: gym@ex.com"), "Ok");
    }

    #[test]
    fn reply_skips_quotes_and_blank_lines() {
        let body = "First line\n\n>quoted without space\nSecond line\n> quoted";
        assert_eq!(clean_reply_content(body), "First line\nSecond line");
    }

    #[test]
    fn reply_falls_back_to_original() {
        let body = "  > everything is quoted  ";
        assert_eq!(clean_reply_content(body), "> everything is quoted");
    }

    #[test]
    fn reply_keeps_words_starting_like_markers() {
        // "Once" is not the "On " marker.
        assert_eq!(clean_reply_content("Once a week\nOnly mornings"), "Once a week\nOnly mornings");
    }

    #[test]
    fn subject_normalization() {
        assert_eq!(core_subject("Re: RE: Fwd: Hello"), "Hello");
        assert_eq!(core_subject("fw:Hello"), "Hello");
        assert_eq!(core_subject("Hello"), "Hello");
        assert_eq!(reply_subject("Re: New Prospect Notification"), "Re: New Prospect Notification");
    }

    #[test]
    fn strip_html_keeps_line_text() {
        assert_eq!(strip_html("<p>Hello</p><p>World</p>"), "Hello World");
        assert_eq!(strip_html("<b>Name:</b> Jo\n<b>Email:</b> jo@x.com"), "Name: Jo\nEmail: jo@x.com");
    }
}
