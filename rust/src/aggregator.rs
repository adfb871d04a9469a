//! Most-recent-message-per-counterparty view over the messages table.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::backend::records::{MessageRecord, ProfileRecord, MESSAGES_TABLE, PROFILES_TABLE};
use crate::backend::{
    decode_rows, Backend, ChangeFilter, ColumnEq, OrderBy, Predicate, Select,
};
use crate::error::SyncError;
use crate::identity::short_identity;
use crate::state::ConversationSummary;

/// `sender = me OR receiver = me`, newest first.
pub fn list_query(me: &str) -> Select {
    Select::from_table(MESSAGES_TABLE)
        .filter(Predicate::any_of(vec![
            vec![ColumnEq::new("sender_id", me)],
            vec![ColumnEq::new("receiver_id", me)],
        ]))
        .order(OrderBy::desc("created_at"))
}

pub fn profiles_query(ids: &[String]) -> Select {
    Select::from_table(PROFILES_TABLE).filter(Predicate::any_of(
        ids.iter().map(|id| vec![ColumnEq::new("id", id)]).collect(),
    ))
}

/// Any insert touching `me` invalidates the list.
pub fn list_feed_filters(me: &str) -> [ChangeFilter; 2] {
    [
        ChangeFilter::inserts_where("sender_id", me),
        ChangeFilter::inserts_where("receiver_id", me),
    ]
}

pub fn relative_time_label(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(at);
    let minutes = elapsed.num_minutes();
    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{minutes}min ago")
    } else if elapsed.num_hours() < 24 {
        format!("{}hr ago", elapsed.num_hours())
    } else {
        at.format("%b %-d, %Y").to_string()
    }
}

/// Counterparties in the order their latest message was discovered (newest first).
pub fn counterparties(me: &str, rows: &[MessageRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    rows.iter()
        .map(|m| m.counterparty_of(me))
        .filter(|cp| seen.insert(cp.to_string()))
        .map(str::to_string)
        .collect()
}

/// Fold messages into one summary per counterparty, keyed on the most recent message.
pub fn summarize(
    me: &str,
    mut rows: Vec<MessageRecord>,
    profiles: &HashMap<String, ProfileRecord>,
    now: DateTime<Utc>,
) -> Vec<ConversationSummary> {
    rows.retain(|m| m.sender_id == me || m.receiver_id == me);
    // Stable: equal timestamps keep the order the store returned them in.
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for m in &rows {
        let cp = m.counterparty_of(me);
        if !seen.insert(cp.to_string()) {
            continue;
        }
        let profile = profiles.get(cp);
        let joined = m.counterparty_ref(me);
        let display_name = profile
            .and_then(|p| p.username.clone())
            .or_else(|| joined.and_then(|j| j.username.clone()))
            .unwrap_or_else(|| short_identity(cp));
        let avatar_url = profile
            .and_then(|p| p.avatar_url.clone())
            .or_else(|| joined.and_then(|j| j.avatar_url.clone()));
        out.push(ConversationSummary {
            counterparty_id: cp.to_string(),
            display_name,
            avatar_url,
            last_message: m.content.clone(),
            last_message_at: m.created_at.timestamp_millis(),
            last_message_is_mine: m.sender_id == me,
            time_label: relative_time_label(m.created_at, now),
        });
    }
    out
}

/// Fetch and fold the current user's conversations. A failed profile lookup
/// falls back to shortened identifiers rather than failing the list.
pub async fn list_conversations(
    backend: &dyn Backend,
    me: &str,
    now: DateTime<Utc>,
) -> Result<Vec<ConversationSummary>, SyncError> {
    let rows: Vec<MessageRecord> = decode_rows(backend.select(list_query(me)).await?)?;
    let ids = counterparties(me, &rows);

    let mut profiles = HashMap::new();
    if !ids.is_empty() {
        match backend.select(profiles_query(&ids)).await {
            Ok(found) => {
                for row in found {
                    match serde_json::from_value::<ProfileRecord>(row) {
                        Ok(p) => {
                            profiles.insert(p.id.clone(), p);
                        }
                        Err(e) => tracing::debug!(%e, "conversations: skipping bad profile row"),
                    }
                }
            }
            Err(e) => tracing::warn!(%e, "conversations: profile lookup failed"),
        }
    }
    Ok(summarize(me, rows, &profiles, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    const A: &str = "aaaaaaaa-0000-4000-8000-000000000001";
    const B: &str = "bbbbbbbb-0000-4000-8000-000000000002";
    const C: &str = "cccccccc-0000-4000-8000-000000000003";

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: &str, from: &str, to: &str, secs: i64) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            content: format!("msg {id}"),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            created_at: at(secs),
            updated_at: None,
            sender: None,
            receiver: None,
        }
    }

    #[test]
    fn keeps_latest_message_per_counterparty() {
        let rows = vec![msg("1", A, B, 1), msg("2", B, A, 3), msg("3", A, C, 2)];
        let out = summarize(A, rows, &HashMap::new(), at(10));
        let ids: Vec<&str> = out.iter().map(|s| s.counterparty_id.as_str()).collect();
        assert_eq!(ids, vec![B, C]);
        assert_eq!(out[0].last_message_at, at(3).timestamp_millis());
        assert_eq!(out[0].last_message, "msg 2");
        assert!(!out[0].last_message_is_mine);
        assert!(out[1].last_message_is_mine);
    }

    #[test]
    fn display_fields_prefer_profile_then_joined_then_short_id() {
        let mut with_join = msg("1", B, A, 2);
        with_join.sender = Some(crate::backend::records::ProfileRef {
            username: Some("bee".into()),
            avatar_url: None,
        });
        let rows = vec![with_join, msg("2", A, C, 1)];
        let mut profiles = HashMap::new();
        profiles.insert(
            C.to_string(),
            ProfileRecord {
                id: C.to_string(),
                username: Some("cee".into()),
                avatar_url: Some("https://x/c.png".into()),
                ..Default::default()
            },
        );
        let out = summarize(A, rows.clone(), &profiles, at(10));
        assert_eq!(out[0].display_name, "bee");
        assert_eq!(out[1].display_name, "cee");
        assert_eq!(out[1].avatar_url.as_deref(), Some("https://x/c.png"));

        let bare = summarize(A, vec![msg("3", A, C, 1)], &HashMap::new(), at(10));
        assert_eq!(bare[0].display_name, "cccccccc");
    }

    #[test]
    fn relative_labels() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        assert_eq!(relative_time_label(now - Duration::seconds(30), now), "just now");
        assert_eq!(relative_time_label(now + Duration::seconds(5), now), "just now");
        assert_eq!(relative_time_label(now - Duration::minutes(5), now), "5min ago");
        assert_eq!(relative_time_label(now - Duration::minutes(59), now), "59min ago");
        assert_eq!(relative_time_label(now - Duration::hours(3), now), "3hr ago");
        assert_eq!(
            relative_time_label(now - Duration::days(9), now),
            "May 1, 2024"
        );
    }

    #[test]
    fn list_query_matches_either_side() {
        let q = list_query(A);
        assert!(q.predicate.matches(&json!({"sender_id": A, "receiver_id": B})));
        assert!(q.predicate.matches(&json!({"sender_id": B, "receiver_id": A})));
        assert!(!q.predicate.matches(&json!({"sender_id": B, "receiver_id": C})));
        assert_eq!(q.order, Some(OrderBy::desc("created_at")));
    }

    #[tokio::test]
    async fn lists_from_backend_with_profiles() {
        let backend = MemoryBackend::with_identity(A);
        backend.seed(
            "messages",
            json!({"id": "1", "content": "hi", "sender_id": A, "receiver_id": B, "created_at": "2024-05-10T11:00:00Z"}),
        );
        backend.seed(
            "messages",
            json!({"id": "2", "content": "yo", "sender_id": C, "receiver_id": A, "created_at": "2024-05-10T11:59:30Z"}),
        );
        backend.seed(
            "messages",
            json!({"id": "3", "content": "other", "sender_id": B, "receiver_id": C, "created_at": "2024-05-10T11:59:50Z"}),
        );
        backend.seed("profiles", json!({"id": B, "username": "bob"}));

        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let out = list_conversations(&backend, A, now).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].counterparty_id, C);
        assert_eq!(out[0].time_label, "just now");
        assert_eq!(out[0].display_name, "cccccccc");
        assert_eq!(out[1].display_name, "bob");
        assert_eq!(out[1].time_label, "1hr ago");
    }

    #[tokio::test]
    async fn surfaces_message_fetch_failure() {
        let backend = MemoryBackend::with_identity(A);
        backend.set_fail_selects(true);
        let err = list_conversations(&backend, A, Utc::now()).await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteFailure(_)));
    }
}
