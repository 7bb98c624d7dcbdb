//! SQLite-backed repositories.
//!
//! Storage: one database file holding conversations, items, and
//! responses. JSON-valued columns (metadata, content, params) are
//! stored as TEXT.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{
    Conversation, ConversationRepo, Item, ItemFilter, ItemRepo, ItemRole, ItemType,
    NewConversation, NewItem, NewResponse, Order, Page, Response, ResponseRepo, ResponseStatus,
};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create store dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open store: {}", path.display()))?;
        Self::init(conn)
    }

    /// Open an in-memory database (tests).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                public_id   TEXT NOT NULL UNIQUE,
                user_id     TEXT NOT NULL,
                title       TEXT,
                is_private  INTEGER NOT NULL DEFAULT 0,
                metadata    TEXT NOT NULL DEFAULT '{}',
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS items (
                id                 INTEGER PRIMARY KEY AUTOINCREMENT,
                public_id          TEXT NOT NULL UNIQUE,
                conversation_id    INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                response_id        INTEGER,
                item_type          TEXT NOT NULL,
                role               TEXT,
                content            TEXT NOT NULL DEFAULT '[]',
                function_name      TEXT,
                function_arguments TEXT,
                created_at         TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_items_conversation
                ON items(conversation_id, created_at, id);
            CREATE TABLE IF NOT EXISTS responses (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                public_id            TEXT NOT NULL UNIQUE,
                user_id              TEXT NOT NULL,
                conversation_id      INTEGER REFERENCES conversations(id) ON DELETE SET NULL,
                previous_response_id TEXT,
                model                TEXT NOT NULL,
                status               TEXT NOT NULL,
                input                TEXT NOT NULL,
                system_prompt        TEXT,
                params               TEXT NOT NULL DEFAULT '{}',
                output               TEXT,
                usage                TEXT,
                error                TEXT,
                created_at           TEXT NOT NULL,
                updated_at           TEXT NOT NULL,
                completed_at         TEXT,
                cancelled_at         TEXT,
                failed_at            TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_responses_conversation
                ON responses(conversation_id, id);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection poisoned")
    }
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp in store: {s}"))?
        .with_timezone(&Utc))
}

fn opt_ts(s: Option<String>) -> anyhow::Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(&v)).transpose()
}

struct ConversationRow {
    id: i64,
    public_id: String,
    user_id: String,
    title: Option<String>,
    is_private: i64,
    metadata: String,
    created_at: String,
    updated_at: String,
}

fn row_to_conversation(row: &Row<'_>) -> rusqlite::Result<ConversationRow> {
    Ok(ConversationRow {
        id: row.get("id")?,
        public_id: row.get("public_id")?,
        user_id: row.get("user_id")?,
        title: row.get("title")?,
        is_private: row.get("is_private")?,
        metadata: row.get("metadata")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn finish_conversation(row: ConversationRow) -> anyhow::Result<Conversation> {
    Ok(Conversation {
        id: row.id,
        public_id: row.public_id,
        user_id: row.user_id,
        title: row.title,
        is_private: row.is_private != 0,
        metadata: serde_json::from_str(&row.metadata).context("bad conversation metadata")?,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
    })
}

struct ItemRow {
    id: i64,
    public_id: String,
    conversation_id: i64,
    response_id: Option<i64>,
    item_type: String,
    role: Option<String>,
    content: String,
    function_name: Option<String>,
    function_arguments: Option<String>,
    created_at: String,
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok(ItemRow {
        id: row.get("id")?,
        public_id: row.get("public_id")?,
        conversation_id: row.get("conversation_id")?,
        response_id: row.get("response_id")?,
        item_type: row.get("item_type")?,
        role: row.get("role")?,
        content: row.get("content")?,
        function_name: row.get("function_name")?,
        function_arguments: row.get("function_arguments")?,
        created_at: row.get("created_at")?,
    })
}

fn finish_item(row: ItemRow) -> anyhow::Result<Item> {
    Ok(Item {
        id: row.id,
        public_id: row.public_id,
        conversation_id: row.conversation_id,
        response_id: row.response_id,
        item_type: ItemType::parse(&row.item_type)
            .with_context(|| format!("bad item type: {}", row.item_type))?,
        role: row
            .role
            .map(|r| ItemRole::parse(&r).with_context(|| format!("bad item role: {r}")))
            .transpose()?,
        content: serde_json::from_str(&row.content).context("bad item content")?,
        function_name: row.function_name,
        function_arguments: row.function_arguments,
        created_at: parse_ts(&row.created_at)?,
    })
}

struct ResponseRow {
    id: i64,
    public_id: String,
    user_id: String,
    conversation_id: Option<i64>,
    previous_response_id: Option<String>,
    model: String,
    status: String,
    input: String,
    system_prompt: Option<String>,
    params: String,
    output: Option<String>,
    usage: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    cancelled_at: Option<String>,
    failed_at: Option<String>,
}

fn row_to_response(row: &Row<'_>) -> rusqlite::Result<ResponseRow> {
    Ok(ResponseRow {
        id: row.get("id")?,
        public_id: row.get("public_id")?,
        user_id: row.get("user_id")?,
        conversation_id: row.get("conversation_id")?,
        previous_response_id: row.get("previous_response_id")?,
        model: row.get("model")?,
        status: row.get("status")?,
        input: row.get("input")?,
        system_prompt: row.get("system_prompt")?,
        params: row.get("params")?,
        output: row.get("output")?,
        usage: row.get("usage")?,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        completed_at: row.get("completed_at")?,
        cancelled_at: row.get("cancelled_at")?,
        failed_at: row.get("failed_at")?,
    })
}

fn finish_response(row: ResponseRow) -> anyhow::Result<Response> {
    Ok(Response {
        id: row.id,
        public_id: row.public_id,
        user_id: row.user_id,
        conversation_id: row.conversation_id,
        previous_response_id: row.previous_response_id,
        model: row.model,
        status: ResponseStatus::parse(&row.status)
            .with_context(|| format!("bad response status: {}", row.status))?,
        input: row.input,
        system_prompt: row.system_prompt,
        params: serde_json::from_str(&row.params).context("bad response params")?,
        output: row.output,
        usage: row.usage,
        error: row.error,
        created_at: parse_ts(&row.created_at)?,
        updated_at: parse_ts(&row.updated_at)?,
        completed_at: opt_ts(row.completed_at)?,
        cancelled_at: opt_ts(row.cancelled_at)?,
        failed_at: opt_ts(row.failed_at)?,
    })
}

const RESPONSE_COLS: &str = "id, public_id, user_id, conversation_id, previous_response_id, \
     model, status, input, system_prompt, params, output, usage, error, \
     created_at, updated_at, completed_at, cancelled_at, failed_at";

#[async_trait]
impl ConversationRepo for SqliteStore {
    async fn create(&self, conv: NewConversation) -> anyhow::Result<Conversation> {
        let now = fmt_ts(Utc::now());
        let public_id = crate::utils::public_id("conv");
        let metadata = serde_json::to_string(&conv.metadata)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO conversations (public_id, user_id, title, is_private, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                public_id,
                conv.user_id,
                conv.title,
                conv.is_private as i64,
                metadata,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        let parts = conn.query_row(
            "SELECT * FROM conversations WHERE id = ?1",
            params![id],
            row_to_conversation,
        )?;
        finish_conversation(parts)
    }

    async fn get_by_id(&self, id: i64) -> anyhow::Result<Option<Conversation>> {
        let conn = self.lock();
        let parts = conn
            .query_row(
                "SELECT * FROM conversations WHERE id = ?1",
                params![id],
                row_to_conversation,
            )
            .optional()?;
        parts.map(finish_conversation).transpose()
    }

    async fn get_by_public_id(
        &self,
        public_id: &str,
        user_id: &str,
    ) -> anyhow::Result<Option<Conversation>> {
        let conn = self.lock();
        let parts = conn
            .query_row(
                "SELECT * FROM conversations WHERE public_id = ?1 AND user_id = ?2",
                params![public_id, user_id],
                row_to_conversation,
            )
            .optional()?;
        parts.map(finish_conversation).transpose()
    }

    async fn delete(&self, id: i64) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        Ok(())
    }
}

#[async_trait]
impl ItemRepo for SqliteStore {
    async fn append(&self, item: NewItem) -> anyhow::Result<Item> {
        item.validate()?;
        let now = fmt_ts(Utc::now());
        let public_id = crate::utils::public_id("msg");
        let content = serde_json::to_string(&item.content)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO items (public_id, conversation_id, response_id, item_type, role,
                                content, function_name, function_arguments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                public_id,
                item.conversation_id,
                item.response_id,
                item.item_type.as_str(),
                item.role.map(|r| r.as_str()),
                content,
                item.function_name,
                item.function_arguments,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        let parts = conn.query_row("SELECT * FROM items WHERE id = ?1", params![id], row_to_item)?;
        finish_item(parts)
    }

    async fn list(&self, filter: ItemFilter, page: Page) -> anyhow::Result<Vec<Item>> {
        let mut sql = String::from("SELECT * FROM items WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(cid) = filter.conversation_id {
            sql.push_str(" AND conversation_id = ?");
            args.push(Box::new(cid));
        }
        if let Some(rid) = filter.response_id {
            sql.push_str(" AND response_id = ?");
            args.push(Box::new(rid));
        }
        if let Some(role) = filter.role {
            sql.push_str(" AND role = ?");
            args.push(Box::new(role.as_str().to_string()));
        }
        if let Some(pid) = filter.public_id {
            sql.push_str(" AND public_id = ?");
            args.push(Box::new(pid));
        }
        if let Some(after) = page.after {
            match page.order {
                Order::Asc => sql.push_str(" AND id > ?"),
                Order::Desc => sql.push_str(" AND id < ?"),
            }
            args.push(Box::new(after));
        }
        match page.order {
            Order::Asc => sql.push_str(" ORDER BY created_at ASC, id ASC"),
            Order::Desc => sql.push_str(" ORDER BY created_at DESC, id DESC"),
        }
        sql.push_str(" LIMIT ?");
        args.push(Box::new(page.limit as i64));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(&arg_refs[..], row_to_item)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(finish_item(row?)?);
        }
        Ok(items)
    }
}

#[async_trait]
impl ResponseRepo for SqliteStore {
    async fn create(&self, resp: NewResponse) -> anyhow::Result<Response> {
        let now = fmt_ts(Utc::now());
        let params_json = serde_json::to_string(&resp.params)?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO responses (public_id, user_id, conversation_id, previous_response_id,
                                    model, status, input, system_prompt, params, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, ?9)",
            params![
                resp.public_id,
                resp.user_id,
                resp.conversation_id,
                resp.previous_response_id,
                resp.model,
                resp.input,
                resp.system_prompt,
                params_json,
                now
            ],
        )?;
        let id = conn.last_insert_rowid();
        let row = conn.query_row(
            &format!("SELECT {RESPONSE_COLS} FROM responses WHERE id = ?1"),
            params![id],
            row_to_response,
        )?;
        finish_response(row)
    }

    async fn get_by_public_id(&self, public_id: &str) -> anyhow::Result<Option<Response>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("SELECT {RESPONSE_COLS} FROM responses WHERE public_id = ?1"),
                params![public_id],
                row_to_response,
            )
            .optional()?;
        row.map(finish_response).transpose()
    }

    async fn list_by_conversation(
        &self,
        conversation_id: i64,
        page: Page,
    ) -> anyhow::Result<Vec<Response>> {
        let mut sql = format!("SELECT {RESPONSE_COLS} FROM responses WHERE conversation_id = ?");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(conversation_id)];
        if let Some(after) = page.after {
            match page.order {
                Order::Asc => sql.push_str(" AND id > ?"),
                Order::Desc => sql.push_str(" AND id < ?"),
            }
            args.push(Box::new(after));
        }
        match page.order {
            Order::Asc => sql.push_str(" ORDER BY id ASC"),
            Order::Desc => sql.push_str(" ORDER BY id DESC"),
        }
        sql.push_str(" LIMIT ?");
        args.push(Box::new(page.limit as i64));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let rows = stmt.query_map(&arg_refs[..], row_to_response)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_response(row?)?);
        }
        Ok(out)
    }

    async fn update_status(&self, id: i64, status: ResponseStatus) -> anyhow::Result<Response> {
        let now = Utc::now();
        let conn = self.lock();
        let current: String = conn.query_row(
            "SELECT status FROM responses WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let current = ResponseStatus::parse(&current)
            .with_context(|| format!("bad stored status: {current}"))?;

        // Terminal states are final: leaving one is a no-op.
        if !current.is_terminal() && current != status {
            let ts_col = match status {
                ResponseStatus::Completed => Some("completed_at"),
                ResponseStatus::Cancelled => Some("cancelled_at"),
                ResponseStatus::Failed => Some("failed_at"),
                ResponseStatus::Pending | ResponseStatus::Running => None,
            };
            let sql = match ts_col {
                Some(col) => format!(
                    "UPDATE responses SET status = ?1, updated_at = ?2, {col} = ?2 WHERE id = ?3"
                ),
                None => "UPDATE responses SET status = ?1, updated_at = ?2 WHERE id = ?3".into(),
            };
            conn.execute(&sql, params![status.as_str(), fmt_ts(now), id])?;
        }

        let row = conn.query_row(
            &format!("SELECT {RESPONSE_COLS} FROM responses WHERE id = ?1"),
            params![id],
            row_to_response,
        )?;
        finish_response(row)
    }

    async fn set_output(&self, id: i64, output: Option<String>) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE responses SET output = ?1, updated_at = ?2 WHERE id = ?3",
            params![output, fmt_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    async fn set_usage(&self, id: i64, usage: Option<String>) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE responses SET usage = ?1, updated_at = ?2 WHERE id = ?3",
            params![usage, fmt_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    async fn set_error(&self, id: i64, error: Option<String>) -> anyhow::Result<()> {
        {
            let conn = self.lock();
            conn.execute(
                "UPDATE responses SET error = ?1, updated_at = ?2 WHERE id = ?3",
                params![error, fmt_ts(Utc::now()), id],
            )?;
        }
        // Recording an error also fails the response.
        self.update_status(id, ResponseStatus::Failed).await?;
        Ok(())
    }

    async fn delete(&self, id: i64) -> anyhow::Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM responses WHERE id = ?1", params![id])?;
        Ok(())
    }
}
