//! Transports for leads, replies, and outbound mail.

pub mod email;
pub mod email_types;
pub mod transport;

pub use email::{EmailConfig, EmailNotifier, EmailTransport};
pub use email_types::InboundEmail;
pub use transport::{
    HotLeadNotifier, LeadTransport, LogNotifier, NewLead, OpenThread, ProspectReply,
};
