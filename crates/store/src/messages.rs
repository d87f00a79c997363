//! Message rows. `seq` is assigned inside the insert transaction, so it is
//! strictly increasing per conversation regardless of caller interleaving.

use rusqlite::{params, Row};

use parley_domain::ids;
use parley_domain::records::{MessageRole, NewMessage, StoredMessage};

use crate::conversations::parse_ts;
use crate::{ConversationStore, StoreError, StoreResult};

fn role_from_str(raw: &str) -> StoreResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        "system" => Ok(MessageRole::System),
        "tool_result" => Ok(MessageRole::ToolResult),
        other => Err(StoreError::Corrupt(format!("message role {other:?}"))),
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<(StoredMessage, String, String, Option<String>)> {
    Ok((
        StoredMessage {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            seq: row.get(2)?,
            role: MessageRole::User,
            content: row.get(4)?,
            agent_id: row.get(5)?,
            created_at: chrono::Utc::now(),
            metadata: None,
        },
        row.get::<_, String>(3)?,
        row.get::<_, String>(6)?,
        row.get::<_, Option<String>>(7)?,
    ))
}

fn finish_row(
    (mut message, role, created, metadata): (StoredMessage, String, String, Option<String>),
) -> StoreResult<StoredMessage> {
    message.role = role_from_str(&role)?;
    message.created_at = parse_ts(&created)?;
    message.metadata = metadata.map(|raw| serde_json::from_str(&raw)).transpose()?;
    Ok(message)
}

const SELECT_COLS: &str =
    "id, conversation_id, seq, role, content, agent_id, created_at, metadata";

impl ConversationStore {
    /// Append a message. Assigns the next `seq` and bumps the parent
    /// conversation's `updated_at` in the same transaction.
    pub fn append_message(
        &self,
        conversation_id: &str,
        msg: NewMessage,
    ) -> StoreResult<StoredMessage> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let exists: bool = tx
                .query_row(
                    "SELECT 1 FROM conversations WHERE id = ?1",
                    params![conversation_id],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !exists {
                return Err(StoreError::NotFound(format!(
                    "conversation {conversation_id}"
                )));
            }

            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;

            let stored = StoredMessage {
                id: ids::new_id(),
                conversation_id: conversation_id.to_owned(),
                seq,
                role: msg.role,
                content: msg.content,
                agent_id: msg.agent_id,
                created_at: ids::now(),
                metadata: msg.metadata,
            };

            let metadata_raw = stored
                .metadata
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT INTO messages \
                 (id, conversation_id, seq, role, content, agent_id, created_at, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    stored.id,
                    stored.conversation_id,
                    stored.seq,
                    stored.role.as_str(),
                    stored.content,
                    stored.agent_id,
                    stored.created_at.to_rfc3339(),
                    metadata_raw,
                ],
            )?;
            tx.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                params![conversation_id, stored.created_at.to_rfc3339()],
            )?;
            tx.commit()?;
            Ok(stored)
        })
    }

    /// Messages of a conversation in `seq` order, optionally only those
    /// after a known sequence number (reconnect backfill).
    pub fn list_messages(
        &self,
        conversation_id: &str,
        after_seq: Option<i64>,
    ) -> StoreResult<Vec<StoredMessage>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLS} FROM messages \
                 WHERE conversation_id = ?1 AND seq > ?2 ORDER BY seq ASC"
            ))?;
            let rows: Vec<_> = stmt
                .query_map(
                    params![conversation_id, after_seq.unwrap_or(0)],
                    row_to_message,
                )?
                .collect::<rusqlite::Result<_>>()?;
            rows.into_iter().map(finish_row).collect()
        })
    }

    /// Merge `partial: true` into a message's metadata. Used when a turn is
    /// cancelled mid-stream and the accumulated text is kept.
    pub fn mark_message_partial(&self, message_id: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let raw: Option<String> = tx
                .query_row(
                    "SELECT metadata FROM messages WHERE id = ?1",
                    params![message_id],
                    |row| row.get(0),
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => {
                        StoreError::NotFound(format!("message {message_id}"))
                    }
                    other => StoreError::Sqlite(other),
                })?;

            let mut metadata: serde_json::Value = match raw {
                Some(raw) => serde_json::from_str(&raw)?,
                None => serde_json::json!({}),
            };
            metadata["partial"] = serde_json::Value::Bool(true);

            tx.execute(
                "UPDATE messages SET metadata = ?2 WHERE id = ?1",
                params![message_id, serde_json::to_string(&metadata)?],
            )?;
            tx.commit()?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_conversation() -> (ConversationStore, String) {
        let store = ConversationStore::open_in_memory().unwrap();
        let conv = store.create_conversation("d1", "alice", None).unwrap();
        (store, conv.id)
    }

    #[test]
    fn seq_is_strictly_increasing() {
        let (store, conv) = store_with_conversation();
        for i in 0..5 {
            store
                .append_message(&conv, NewMessage::user(format!("msg {i}")))
                .unwrap();
        }
        let messages = store.list_messages(&conv, None).unwrap();
        assert_eq!(messages.len(), 5);
        for window in messages.windows(2) {
            assert!(window[0].seq < window[1].seq);
            assert!(window[0].created_at <= window[1].created_at);
        }
    }

    #[test]
    fn append_to_missing_conversation_fails() {
        let store = ConversationStore::open_in_memory().unwrap();
        assert!(matches!(
            store.append_message("ghost", NewMessage::user("hi")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn after_seq_backfill() {
        let (store, conv) = store_with_conversation();
        store.append_message(&conv, NewMessage::user("one")).unwrap();
        let second = store
            .append_message(&conv, NewMessage::assistant("two", "a1"))
            .unwrap();
        store.append_message(&conv, NewMessage::user("three")).unwrap();

        let tail = store.list_messages(&conv, Some(second.seq)).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].content, "three");
    }

    #[test]
    fn appended_message_bumps_conversation_updated_at() {
        let (store, conv) = store_with_conversation();
        let before = store.get_conversation(&conv).unwrap().updated_at;
        let msg = store.append_message(&conv, NewMessage::user("hi")).unwrap();
        let after = store.get_conversation(&conv).unwrap().updated_at;
        assert_eq!(after, msg.created_at);
        assert!(after >= before);
    }

    #[test]
    fn metadata_round_trips() {
        let (store, conv) = store_with_conversation();
        let msg = store
            .append_message(
                &conv,
                NewMessage::tool_result("done", serde_json::json!({"call_id": "c1"})),
            )
            .unwrap();
        let fetched = &store.list_messages(&conv, None).unwrap()[0];
        assert_eq!(fetched.id, msg.id);
        assert_eq!(fetched.role, MessageRole::ToolResult);
        assert_eq!(fetched.metadata.as_ref().unwrap()["call_id"], "c1");
    }

    #[test]
    fn mark_partial_merges_metadata() {
        let (store, conv) = store_with_conversation();
        let msg = store
            .append_message(
                &conv,
                NewMessage::assistant("half an answ", "a1")
                    .with_metadata(serde_json::json!({"error": "cancelled"})),
            )
            .unwrap();
        store.mark_message_partial(&msg.id).unwrap();

        let fetched = &store.list_messages(&conv, None).unwrap()[0];
        let meta = fetched.metadata.as_ref().unwrap();
        assert_eq!(meta["partial"], true);
        assert_eq!(meta["error"], "cancelled");
    }
}
