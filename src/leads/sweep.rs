//! Cold-lead sweep: parks threads where the prospect went quiet.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::config::SystemConfig;
use crate::error::DatabaseError;
use crate::leads::model::{Conversation, ConversationStatus, MessageRole};
use crate::store::LeadStore;

/// Whether a conversation should go cold now.
///
/// All of: notifications enabled, still active, quiet for longer than the
/// threshold, and the last word was ours. A thread where the prospect
/// spoke last never goes cold, however old.
pub fn is_cold_candidate(
    conversation: &Conversation,
    last_role: Option<MessageRole>,
    config: &SystemConfig,
    now: DateTime<Utc>,
) -> bool {
    let cutoff = now - Duration::days(i64::from(config.cold_lead_threshold_days));
    config.cold_lead_notifications_enabled
        && conversation.status == ConversationStatus::Active
        && conversation.last_message_at < cutoff
        && last_role.is_some_and(|role| role.is_outbound())
}

/// Mark every qualifying conversation cold and return them.
///
/// Re-running is a no-op for threads already cold. One thread failing does
/// not stop the rest.
pub async fn sweep_cold(
    store: &dyn LeadStore,
    now: DateTime<Utc>,
) -> Result<Vec<Conversation>, DatabaseError> {
    let config = store.load_system_config().await?;
    if !config.cold_lead_notifications_enabled {
        debug!("Cold-lead sweep disabled");
        return Ok(Vec::new());
    }

    let cutoff = now - Duration::days(i64::from(config.cold_lead_threshold_days));
    let stale = store.list_stale_active(cutoff).await?;
    let mut marked = Vec::new();

    for mut conversation in stale {
        let last_role = match store.last_message_role(conversation.id).await {
            Ok(role) => role,
            Err(e) => {
                warn!(conversation_id = %conversation.id, error = %e, "Skipping thread in cold sweep");
                continue;
            }
        };
        if !is_cold_candidate(&conversation, last_role, &config, now) {
            continue;
        }
        match store.mark_cold(conversation.id, now).await {
            Ok(true) => {
                conversation.status = ConversationStatus::Cold;
                conversation.updated_at = now;
                marked.push(conversation);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(conversation_id = %conversation.id, error = %e, "Failed to mark thread cold");
            }
        }
    }

    if !marked.is_empty() {
        info!(count = marked.len(), days = config.cold_lead_threshold_days, "Marked leads cold");
    }
    Ok(marked)
}
