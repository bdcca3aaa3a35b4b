//! Email transport: IMAP polling for leads and replies, SMTP via lettre
//! for approved drafts and hot-lead alerts.
//!
//! IMAP and SMTP are blocking and run on `spawn_blocking`.

use std::io::{Read, Write as IoWrite};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::email_types::{
    InboundEmail, clean_reply_content, core_subject, parse_lead_notification, strip_html,
};
use crate::channels::transport::{
    HotLeadNotifier, LeadTransport, NewLead, OpenThread, ProspectReply, hot_lead_summary,
};
use crate::error::TransportError;
use crate::leads::model::{Conversation, Prospect};
use crate::leads::scoring::LeadScore;

const TRANSPORT_NAME: &str = "email";

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox settings, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl EmailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (email disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST").ok()?;

        let imap_port: u16 = std::env::var("EMAIL_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            imap_host,
            imap_port,
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
        })
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// One mailbox serves both lead notifications and prospect replies.
///
/// Every fetch drains UNSEEN mail into `inbox`. Lead notifications wait
/// there for `fetch_new_leads`; everything else is offered to
/// `fetch_replies` and dropped if no open thread claims it.
pub struct EmailTransport {
    config: EmailConfig,
    inbox: Mutex<Vec<InboundEmail>>,
}

impl EmailTransport {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            inbox: Mutex::new(Vec::new()),
        }
    }

    /// Pull unseen mail into the inbox buffer.
    async fn refill(&self) -> Result<(), TransportError> {
        let cfg = self.config.clone();
        let fetched = tokio::task::spawn_blocking(move || fetch_unseen_imap(&cfg))
            .await
            .map_err(|e| fetch_failed(format!("IMAP task panicked: {e}")))??;

        if !fetched.is_empty() {
            debug!(count = fetched.len(), "Fetched unseen email");
        }
        self.lock_inbox().extend(fetched);
        Ok(())
    }

    fn lock_inbox(&self) -> std::sync::MutexGuard<'_, Vec<InboundEmail>> {
        self.inbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LeadTransport for EmailTransport {
    fn name(&self) -> &str {
        TRANSPORT_NAME
    }

    async fn fetch_new_leads(&self) -> Result<Vec<NewLead>, TransportError> {
        self.refill().await?;
        let mut inbox = self.lock_inbox();
        let (leads, rest) = split_leads(std::mem::take(&mut *inbox));
        *inbox = rest;
        Ok(leads)
    }

    async fn fetch_replies(&self, open: &[OpenThread]) -> Result<Vec<ProspectReply>, TransportError> {
        self.refill().await?;
        let mut inbox = self.lock_inbox();
        let (notifications, others): (Vec<_>, Vec<_>) = std::mem::take(&mut *inbox)
            .into_iter()
            .partition(InboundEmail::is_lead_notification);
        *inbox = notifications;

        let mut replies = Vec::new();
        for email in others {
            match match_reply(&email, open) {
                Some(reply) => replies.push(reply),
                None => debug!(
                    sender = %email.sender,
                    subject = %email.subject,
                    "Dropping email that matches no open thread"
                ),
            }
        }
        Ok(replies)
    }

    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
        let cfg = self.config.clone();
        let (to, subject, body) = (to.to_string(), subject.to_string(), body.to_string());
        tokio::task::spawn_blocking(move || send_smtp(&cfg, &to, &subject, &body))
            .await
            .map_err(|e| TransportError::SendFailed {
                name: TRANSPORT_NAME.into(),
                reason: format!("SMTP task panicked: {e}"),
            })?
    }
}

/// Sends hot-lead alerts to the sales team's address.
pub struct EmailNotifier {
    transport: Arc<dyn LeadTransport>,
    to: String,
}

impl EmailNotifier {
    pub fn new(transport: Arc<dyn LeadTransport>, to: impl Into<String>) -> Self {
        Self {
            transport,
            to: to.into(),
        }
    }
}

#[async_trait]
impl HotLeadNotifier for EmailNotifier {
    async fn notify_hot_lead(
        &self,
        conversation: &Conversation,
        prospect: &Prospect,
        score: &LeadScore,
    ) -> Result<(), TransportError> {
        let (subject, body) = hot_lead_summary(conversation, prospect, score);
        self.transport.send(&self.to, &subject, &body).await?;
        info!(conversation_id = %conversation.id, to = %self.to, "Hot-lead alert sent");
        Ok(())
    }
}

// ── Helpers (public for testing) ────────────────────────────────────

/// Parse lead notifications out of a batch. Returns the leads and every
/// email that was not a notification. Malformed notifications are dropped.
pub fn split_leads(emails: Vec<InboundEmail>) -> (Vec<NewLead>, Vec<InboundEmail>) {
    let mut leads = Vec::new();
    let mut rest = Vec::new();
    for email in emails {
        if !email.is_lead_notification() {
            rest.push(email);
            continue;
        }
        match parse_lead_notification(&email.body, &email.subject, email.received_at) {
            Ok(lead) => leads.push(lead),
            Err(e) => warn!(message_id = %email.message_id, error = %e, "Skipping malformed lead notification"),
        }
    }
    (leads, rest)
}

/// Attribute an email to an open thread by sender and core subject.
pub fn match_reply(email: &InboundEmail, open: &[OpenThread]) -> Option<ProspectReply> {
    let subject = core_subject(&email.subject);
    open.iter()
        .find(|t| {
            t.prospect_email.eq_ignore_ascii_case(&email.sender)
                && core_subject(&t.thread_subject).eq_ignore_ascii_case(subject)
        })
        .map(|t| ProspectReply {
            thread_subject: t.thread_subject.clone(),
            prospect_email: t.prospect_email.clone(),
            reply_text: clean_reply_content(&email.body),
            received_at: email.received_at,
        })
}

/// Turn raw RFC 822 bytes into an `InboundEmail`.
pub fn parse_raw_email(raw: &[u8]) -> Option<InboundEmail> {
    let parsed = MessageParser::default().parse(raw)?;
    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or_else(Utc::now);

    Some(InboundEmail {
        message_id: parsed
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4())),
        sender: extract_sender(&parsed),
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        body: extract_text(&parsed),
        received_at,
    })
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

fn fetch_failed(reason: impl Into<String>) -> TransportError {
    TransportError::FetchFailed {
        name: TRANSPORT_NAME.into(),
        reason: reason.into(),
    }
}

fn send_smtp(config: &EmailConfig, to: &str, subject: &str, body: &str) -> Result<(), TransportError> {
    let send_failed = |reason: String| TransportError::SendFailed {
        name: TRANSPORT_NAME.into(),
        reason,
    };

    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );
    let transport = SmtpTransport::relay(&config.smtp_host)
        .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let email = Message::builder()
        .from(
            config
                .from_address
                .parse()
                .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
        )
        .to(to
            .parse()
            .map_err(|e| send_failed(format!("Invalid to address: {e}")))?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))?;

    transport
        .send(&email)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;

    info!(to = %to, subject = %subject, "Email sent");
    Ok(())
}

// ── IMAP ────────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// Minimal tagged-command IMAP session over TLS.
struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    fn connect(config: &EmailConfig) -> Result<Self, TransportError> {
        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))
            .map_err(|e| fetch_failed(format!("IMAP connect: {e}")))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))
            .map_err(|e| fetch_failed(format!("IMAP socket: {e}")))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(config.imap_host.clone())
            .map_err(|e| fetch_failed(format!("Invalid IMAP host: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| fetch_failed(format!("TLS setup: {e}")))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
        };
        let _greeting = session.read_line()?;
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(fetch_failed("IMAP connection closed")),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).into_owned());
                    }
                }
                Err(e) => return Err(fetch_failed(format!("IMAP read: {e}"))),
            }
        }
    }

    /// Send one command; returns every response line up to the tagged one.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, TransportError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let full = format!("{tag} {cmd}\r\n");
        IoWrite::write_all(&mut self.tls, full.as_bytes())
            .and_then(|()| IoWrite::flush(&mut self.tls))
            .map_err(|e| fetch_failed(format!("IMAP write: {e}")))?;

        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }

    fn login(&mut self, config: &EmailConfig) -> Result<(), TransportError> {
        let resp = self.command(&format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ))?;
        if resp.last().is_some_and(|l| l.contains("OK")) {
            Ok(())
        } else {
            Err(TransportError::AuthFailed {
                name: TRANSPORT_NAME.into(),
                reason: "IMAP login rejected".into(),
            })
        }
    }
}

/// Fetch unseen emails and flag them seen (blocking, run in spawn_blocking).
fn fetch_unseen_imap(config: &EmailConfig) -> Result<Vec<InboundEmail>, TransportError> {
    let mut session = ImapSession::connect(config)?;
    session.login(config)?;
    session.command("SELECT \"INBOX\"")?;

    let search = session.command("SEARCH UNSEEN")?;
    let ids: Vec<String> = search
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2).map(String::from))
        .collect();

    let mut emails = Vec::with_capacity(ids.len());
    for id in &ids {
        let resp = session.command(&format!("FETCH {id} RFC822"))?;
        // Drop the untagged FETCH line and the closing ")" + tagged lines.
        let raw: String = resp
            .iter()
            .skip(1)
            .take(resp.len().saturating_sub(3))
            .cloned()
            .collect();

        match parse_raw_email(raw.as_bytes()) {
            Some(email) => emails.push(email),
            None => warn!(id = %id, "Unparsable email skipped"),
        }

        if let Err(e) = session.command(&format!("STORE {id} +FLAGS (\\Seen)")) {
            warn!(id = %id, error = %e, "Failed to flag email seen");
        }
    }

    let _ = session.command("LOGOUT");
    Ok(emails)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(sender: &str, subject: &str, body: &str) -> InboundEmail {
        InboundEmail {
            message_id: format!("<{}@test>", Uuid::new_v4()),
            sender: sender.into(),
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
        }
    }

    fn open_thread() -> OpenThread {
        OpenThread {
            conversation_id: Uuid::new_v4(),
            prospect_email: "jo@example.com".into(),
            thread_subject: "New Prospect Notification - Downtown".into(),
        }
    }

    #[test]
    fn reply_matched_by_sender_and_core_subject() {
        let open = [open_thread()];
        let e = email(
            "JO@example.com",
            "RE: Re: New Prospect Notification - Downtown",
            "Tuesday works\n\nOn Mon, Gym wrote:\n> hi",
        );
        let reply = match_reply(&e, &open).unwrap();
        assert_eq!(reply.thread_subject, "New Prospect Notification - Downtown");
        assert_eq!(reply.reply_text, "Tuesday works");
    }

    #[test]
    fn reply_from_other_sender_or_subject_ignored() {
        let open = [open_thread()];
        assert!(match_reply(&email("sam@example.com", "Re: New Prospect Notification - Downtown", "x"), &open).is_none());
        assert!(match_reply(&email("jo@example.com", "Re: something else", "x"), &open).is_none());
    }

    #[test]
    fn split_separates_notifications() {
        let batch = vec![
            email("forms@gym.com", "New Prospect Notification - Downtown", "Name: Jo Park\nEmail: jo@example.com"),
            email("forms@gym.com", "New Prospect Notification - Downtown", "Name: nobody"),
            email("jo@example.com", "Re: New Prospect Notification - Downtown", "hi"),
        ];
        let (leads, rest) = split_leads(batch);
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].first_name, "Jo");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].sender, "jo@example.com");
    }

    #[test]
    fn raw_email_parsed() {
        let raw = b"From: Jo Park <Jo@Example.com>\r\n\
Subject: Re: New Prospect Notification\r\n\
Message-ID: <abc@example.com>\r\n\
Date: Tue, 4 Mar 2025 10:00:00 +0000\r\n\
Content-Type: text/plain\r\n\
\r\n\
Sounds good!\r\n";
        let parsed = parse_raw_email(raw).unwrap();
        assert_eq!(parsed.sender, "jo@example.com");
        assert_eq!(parsed.subject, "Re: New Prospect Notification");
        assert_eq!(parsed.message_id, "abc@example.com");
        assert!(parsed.body.contains("Sounds good!"));
        assert_eq!(parsed.received_at.to_rfc3339(), "2025-03-04T10:00:00+00:00");
    }

    #[test]
    fn config_from_env_returns_none_when_no_host() {
        // SAFETY: no other test reads EMAIL_IMAP_HOST.
        unsafe { std::env::remove_var("EMAIL_IMAP_HOST") };
        assert!(EmailConfig::from_env().is_none());
    }

    #[tokio::test]
    async fn notifier_sends_summary_through_transport() {
        use crate::leads::model::ConversationStatus;
        use crate::leads::scoring::LeadTemperature;

        struct Outbox(Mutex<Vec<(String, String)>>);

        #[async_trait]
        impl LeadTransport for Outbox {
            fn name(&self) -> &str {
                "outbox"
            }
            async fn fetch_new_leads(&self) -> Result<Vec<NewLead>, TransportError> {
                Ok(Vec::new())
            }
            async fn fetch_replies(&self, _open: &[OpenThread]) -> Result<Vec<ProspectReply>, TransportError> {
                Ok(Vec::new())
            }
            async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<(), TransportError> {
                self.0.lock().unwrap().push((to.into(), subject.into()));
                Ok(())
            }
        }

        let outbox = Arc::new(Outbox(Mutex::new(Vec::new())));
        let notifier = EmailNotifier::new(outbox.clone(), "sales@gym.com");
        let now = Utc::now();
        let prospect = Prospect {
            id: Uuid::new_v4(),
            email: "jo@example.com".into(),
            first_name: "Jo".into(),
            phone: Some("555".into()),
            created_at: now,
            updated_at: now,
        };
        let conversation = Conversation {
            id: Uuid::new_v4(),
            prospect_id: prospect.id,
            thread_subject: "S".into(),
            status: ConversationStatus::Active,
            outcome: None,
            intent: None,
            lead_score: Some(0.8),
            created_at: now,
            last_message_at: now,
            updated_at: now,
        };
        let score = LeadScore {
            score: 0.8,
            factors: Vec::new(),
            is_hot: true,
            recommendations: Vec::new(),
            temperature: LeadTemperature::VeryHot,
            reason: String::new(),
        };
        notifier
            .notify_hot_lead(&conversation, &prospect, &score)
            .await
            .unwrap();

        let sent = outbox.0.lock().unwrap();
        assert_eq!(sent.as_slice(), &[("sales@gym.com".to_string(), "Hot lead: Jo (80%)".to_string())]);
    }
}
