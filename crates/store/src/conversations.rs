//! Conversation rows.

use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

use parley_domain::ids;
use parley_domain::records::{Conversation, ConversationStatus};

use crate::{ConversationStore, StoreError, StoreResult};

pub(crate) fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

fn status_from_str(raw: &str) -> StoreResult<ConversationStatus> {
    match raw {
        "open" => Ok(ConversationStatus::Open),
        "review_requested" => Ok(ConversationStatus::ReviewRequested),
        "merged" => Ok(ConversationStatus::Merged),
        "closed" => Ok(ConversationStatus::Closed),
        other => Err(StoreError::Corrupt(format!("conversation status {other:?}"))),
    }
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<(Conversation, String, String, String)> {
    Ok((
        Conversation {
            id: row.get(0)?,
            domain_id: row.get(1)?,
            initial_agent_id: row.get(2)?,
            // Timestamps and status are parsed by the caller so parse
            // failures surface as StoreError::Corrupt, not rusqlite errors.
            created_at: Utc::now(),
            updated_at: Utc::now(),
            title: row.get(5)?,
            creator_sub: row.get(6)?,
            status: ConversationStatus::Open,
        },
        row.get::<_, String>(3)?,
        row.get::<_, String>(4)?,
        row.get::<_, String>(7)?,
    ))
}

fn finish_row(
    (mut conversation, created, updated, status): (Conversation, String, String, String),
) -> StoreResult<Conversation> {
    conversation.created_at = parse_ts(&created)?;
    conversation.updated_at = parse_ts(&updated)?;
    conversation.status = status_from_str(&status)?;
    Ok(conversation)
}

const SELECT_COLS: &str =
    "id, domain_id, initial_agent_id, created_at, updated_at, title, creator_sub, status";

impl ConversationStore {
    /// Create a new conversation in `open` status.
    pub fn create_conversation(
        &self,
        domain_id: &str,
        creator_sub: &str,
        title: Option<&str>,
    ) -> StoreResult<Conversation> {
        let conversation = Conversation {
            id: ids::new_id(),
            domain_id: domain_id.to_owned(),
            initial_agent_id: None,
            created_at: ids::now(),
            updated_at: ids::now(),
            title: title.map(str::to_owned),
            creator_sub: creator_sub.to_owned(),
            status: ConversationStatus::Open,
        };
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations \
                 (id, domain_id, initial_agent_id, created_at, updated_at, title, creator_sub, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    conversation.id,
                    conversation.domain_id,
                    conversation.initial_agent_id,
                    conversation.created_at.to_rfc3339(),
                    conversation.updated_at.to_rfc3339(),
                    conversation.title,
                    conversation.creator_sub,
                    conversation.status.as_str(),
                ],
            )?;
            Ok(())
        })?;
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: &str) -> StoreResult<Conversation> {
        self.with_conn(|conn| {
            let raw = conn
                .query_row(
                    &format!("SELECT {SELECT_COLS} FROM conversations WHERE id = ?1"),
                    params![id],
                    row_to_conversation,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StoreError::NotFound(format!("conversation {id}"))
                    }
                    other => StoreError::Sqlite(other),
                })?;
            finish_row(raw)
        })
    }

    /// List conversations, newest-updated first. `creator_sub` filters to
    /// one identity when set.
    pub fn list_conversations(&self, creator_sub: Option<&str>) -> StoreResult<Vec<Conversation>> {
        self.with_conn(|conn| {
            let (sql, filter) = match creator_sub {
                Some(sub) => (
                    format!(
                        "SELECT {SELECT_COLS} FROM conversations \
                         WHERE creator_sub = ?1 ORDER BY updated_at DESC"
                    ),
                    Some(sub.to_owned()),
                ),
                None => (
                    format!("SELECT {SELECT_COLS} FROM conversations ORDER BY updated_at DESC"),
                    None,
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows: Vec<_> = match &filter {
                Some(sub) => stmt
                    .query_map(params![sub], row_to_conversation)?
                    .collect::<rusqlite::Result<_>>()?,
                None => stmt
                    .query_map([], row_to_conversation)?
                    .collect::<rusqlite::Result<_>>()?,
            };
            rows.into_iter().map(finish_row).collect()
        })
    }

    /// Record the agent the first turn routed to (set once).
    pub fn set_initial_agent(&self, conversation_id: &str, agent_id: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conversations SET initial_agent_id = ?2 \
                 WHERE id = ?1 AND initial_agent_id IS NULL",
                params![conversation_id, agent_id],
            )?;
            Ok(())
        })
    }

    pub fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE conversations SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![conversation_id, status.as_str(), ids::now().to_rfc3339()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!(
                    "conversation {conversation_id}"
                )));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get() {
        let store = ConversationStore::open_in_memory().unwrap();
        let created = store
            .create_conversation("software_development", "alice", Some("deploy help"))
            .unwrap();
        let fetched = store.get_conversation(&created.id).unwrap();
        assert_eq!(fetched.domain_id, "software_development");
        assert_eq!(fetched.creator_sub, "alice");
        assert_eq!(fetched.title.as_deref(), Some("deploy help"));
        assert_eq!(fetched.status, ConversationStatus::Open);
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = ConversationStore::open_in_memory().unwrap();
        assert!(matches!(
            store.get_conversation("nope"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn list_filters_by_creator() {
        let store = ConversationStore::open_in_memory().unwrap();
        store.create_conversation("d", "alice", None).unwrap();
        store.create_conversation("d", "bob", None).unwrap();
        store.create_conversation("d", "alice", None).unwrap();

        assert_eq!(store.list_conversations(None).unwrap().len(), 3);
        assert_eq!(store.list_conversations(Some("alice")).unwrap().len(), 2);
        assert_eq!(store.list_conversations(Some("carol")).unwrap().len(), 0);
    }

    #[test]
    fn initial_agent_is_set_once() {
        let store = ConversationStore::open_in_memory().unwrap();
        let conv = store.create_conversation("d", "alice", None).unwrap();
        store.set_initial_agent(&conv.id, "a1").unwrap();
        store.set_initial_agent(&conv.id, "a2").unwrap();
        assert_eq!(
            store
                .get_conversation(&conv.id)
                .unwrap()
                .initial_agent_id
                .as_deref(),
            Some("a1")
        );
    }

    #[test]
    fn status_update() {
        let store = ConversationStore::open_in_memory().unwrap();
        let conv = store.create_conversation("d", "alice", None).unwrap();
        store
            .set_conversation_status(&conv.id, ConversationStatus::Closed)
            .unwrap();
        assert_eq!(
            store.get_conversation(&conv.id).unwrap().status,
            ConversationStatus::Closed
        );
        assert!(store
            .set_conversation_status("ghost", ConversationStatus::Closed)
            .is_err());
    }
}
