use rusqlite::{params, Connection, OptionalExtension, Result};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).ok();
        let db_path = data_dir.join("confab.db");
        let conn = Connection::open(&db_path)?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    // ── settings ──

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(())
    }

    // ── chats ──

    pub fn create_chat(&self, title: &str) -> Result<ChatData> {
        let chat = ChatData {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO chats (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![chat.id, chat.title, chat.created_at, chat.updated_at],
        )?;
        Ok(chat)
    }

    pub fn list_chats(&self) -> Result<Vec<ChatData>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, title, created_at, updated_at FROM chats ORDER BY updated_at DESC",
        )?;
        let chats = stmt.query_map([], |row| {
            Ok(ChatData {
                id: row.get(0)?,
                title: row.get(1)?,
                created_at: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;
        chats.collect()
    }

    pub fn get_chat(&self, chat_id: &str) -> Result<Option<ChatData>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, title, created_at, updated_at FROM chats WHERE id = ?1",
            [chat_id],
            |row| {
                Ok(ChatData {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    created_at: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )
        .optional()
    }

    pub fn delete_chat(&self, chat_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM messages WHERE chat_id = ?1", [chat_id])?;
        conn.execute("DELETE FROM chats WHERE id = ?1", [chat_id])?;
        Ok(())
    }

    pub fn update_chat_title(&self, chat_id: &str, title: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE chats SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, now, chat_id],
        )?;
        Ok(())
    }

    // ── messages ──

    pub fn add_message(&self, chat_id: &str, role: &str, content: &str) -> Result<MessageData> {
        let message = MessageData {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages (id, chat_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![message.id, message.chat_id, message.role, message.content, message.created_at],
        )?;
        conn.execute(
            "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
            params![message.created_at, chat_id],
        )?;
        Ok(message)
    }

    pub fn get_messages(&self, chat_id: &str) -> Result<Vec<MessageData>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, role, content, created_at
             FROM messages WHERE chat_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let messages = stmt.query_map([chat_id], |row| {
            Ok(MessageData {
                id: row.get(0)?,
                chat_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        messages.collect()
    }

    pub fn count_messages(&self, chat_id: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE chat_id = ?1",
            [chat_id],
            |row| row.get::<_, i64>(0),
        )
        .map(|n| n as u64)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatData {
    pub id: String,
    pub title: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MessageData {
    pub id: String,
    #[serde(rename = "chatId")]
    pub chat_id: String,
    pub role: String,
    pub content: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_roundtrip_and_overwrite() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.get_setting("selected_model").unwrap(), None);
        db.set_setting("selected_model", "a").unwrap();
        db.set_setting("selected_model", "b").unwrap();
        assert_eq!(db.get_setting("selected_model").unwrap(), Some("b".to_string()));
        db.delete_setting("selected_model").unwrap();
        assert_eq!(db.get_setting("selected_model").unwrap(), None);
    }

    #[test]
    fn test_chat_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        let chat = db.create_chat("New chat").unwrap();
        assert_eq!(db.list_chats().unwrap().len(), 1);
        assert!(db.get_chat(&chat.id).unwrap().is_some());

        db.add_message(&chat.id, "user", "hello").unwrap();
        db.add_message(&chat.id, "assistant", "hi there").unwrap();
        let messages = db.get_messages(&chat.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(db.count_messages(&chat.id).unwrap(), 2);

        db.delete_chat(&chat.id).unwrap();
        assert!(db.get_chat(&chat.id).unwrap().is_none());
        assert_eq!(db.get_messages(&chat.id).unwrap().len(), 0);
    }

    #[test]
    fn test_update_chat_title() {
        let db = Database::open_in_memory().unwrap();
        let chat = db.create_chat("New chat").unwrap();
        db.update_chat_title(&chat.id, "Weather question").unwrap();
        assert_eq!(db.get_chat(&chat.id).unwrap().unwrap().title, "Weather question");
    }
}
