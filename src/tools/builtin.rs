//! Built-in adapter tools.
//!
//! The `mcp.*` family (filesystem, HTTP, SQLite, shell, git) mirrors the
//! external adapters most plans lean on; alongside them live the local
//! utility tools (math, session recall, messaging), the fetch pair
//! (`web_fetch`, `pdf.text`) and `agent.delegate`, which re-enters the
//! executor with a fresh prompt.

use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::Runtime;
use crate::context::RunContext;
use crate::store::Store;
use crate::tools::{Tool, ToolError, optional_u64, require_str};

const MAX_TEXT_BYTES: usize = 200_000;
const MAX_STDERR_BYTES: usize = 50_000;

/// Everything the built-in tools need from the runtime.
pub struct BuiltinDeps {
    pub store: Arc<Store>,
    pub http: reqwest::Client,
    pub runtime: Weak<Runtime>,
}

/// Construct the built-in tool set. `enable_mcp` gates the `mcp.*` family.
pub fn builtin_tools(deps: &BuiltinDeps, enable_mcp: bool) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(MathEvalTool),
        Arc::new(WebFetchTool {
            http: deps.http.clone(),
        }),
        Arc::new(PdfTextTool),
        Arc::new(SessionRecallTool {
            store: deps.store.clone(),
        }),
        Arc::new(MsgSendTool {
            store: deps.store.clone(),
        }),
        Arc::new(MsgFetchTool {
            store: deps.store.clone(),
        }),
        Arc::new(DelegateTool {
            runtime: deps.runtime.clone(),
        }),
    ];
    if enable_mcp {
        tools.push(Arc::new(FsReadTool));
        tools.push(Arc::new(HttpGetTool {
            http: deps.http.clone(),
        }));
        tools.push(Arc::new(SqliteQueryTool));
        tools.push(Arc::new(ShellRunTool));
        tools.push(Arc::new(GitStatusTool));
    }
    tools
}

fn truncate_front(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn truncate_back(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

// --- mcp.fs.read ---

struct FsReadTool;

#[async_trait]
impl Tool for FsReadTool {
    fn name(&self) -> &str {
        "mcp.fs.read"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from disk."
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        }))
    }

    async fn run(&self, args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
        let path = require_str(&args, "path")?.to_string();
        let text = tokio::fs::read_to_string(&path).await?;
        Ok(json!({ "text": text }))
    }
}

// --- mcp.http.get / web_fetch ---

struct HttpGetTool {
    http: reqwest::Client,
}

#[async_trait]
impl Tool for HttpGetTool {
    fn name(&self) -> &str {
        "mcp.http.get"
    }

    fn description(&self) -> &str {
        "HTTP GET a URL and return the response body."
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "timeout": { "type": "integer" }
            },
            "required": ["url"]
        }))
    }

    async fn run(&self, args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
        let url = require_str(&args, "url")?;
        let timeout = Duration::from_secs(optional_u64(&args, "timeout", 15).max(1));
        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        Ok(json!({ "text": truncate_front(&body, MAX_TEXT_BYTES) }))
    }
}

struct WebFetchTool {
    http: reqwest::Client,
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its raw text."
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": { "url": { "type": "string" } },
            "required": ["url"]
        }))
    }

    async fn run(&self, args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
        let url = require_str(&args, "url")?;
        let response = self
            .http
            .get(url)
            .timeout(Duration::from_secs(15))
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        Ok(json!({ "text": truncate_front(&body, MAX_TEXT_BYTES) }))
    }
}

// --- mcp.sqlite.query ---

struct SqliteQueryTool;

#[async_trait]
impl Tool for SqliteQueryTool {
    fn name(&self) -> &str {
        "mcp.sqlite.query"
    }

    fn description(&self) -> &str {
        "Run a read query against a SQLite database file."
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "db_path": { "type": "string" },
                "query": { "type": "string" }
            },
            "required": ["db_path", "query"]
        }))
    }

    async fn run(&self, args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
        let db_path = require_str(&args, "db_path")?.to_string();
        let query = require_str(&args, "query")?.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            let mut stmt = conn
                .prepare(&query)
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let width = columns.len();
            let mut rows = Vec::new();
            let mut raw = stmt
                .query([])
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            while let Some(row) = raw
                .next()
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
            {
                let mut out = Vec::with_capacity(width);
                for i in 0..width {
                    let value = match row.get_ref(i) {
                        Ok(rusqlite::types::ValueRef::Null) => Value::Null,
                        Ok(rusqlite::types::ValueRef::Integer(v)) => json!(v),
                        Ok(rusqlite::types::ValueRef::Real(v)) => json!(v),
                        Ok(rusqlite::types::ValueRef::Text(t)) => {
                            json!(String::from_utf8_lossy(t))
                        }
                        Ok(rusqlite::types::ValueRef::Blob(b)) => json!(format!("<{} bytes>", b.len())),
                        Err(e) => return Err(ToolError::ExecutionFailed(e.to_string())),
                    };
                    out.push(value);
                }
                rows.push(Value::Array(out));
            }
            Ok(json!({ "columns": columns, "rows": rows }))
        })
        .await
        .map_err(|e| ToolError::ExecutionFailed(format!("join error: {e}")))?
    }
}

// --- mcp.shell.run ---

struct ShellRunTool;

#[async_trait]
impl Tool for ShellRunTool {
    fn name(&self) -> &str {
        "mcp.shell.run"
    }

    fn description(&self) -> &str {
        "Run a shell command and capture its output. Flagged risky by default."
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": {
                "cmd": { "type": "string" },
                "timeout": { "type": "integer" }
            },
            "required": ["cmd"]
        }))
    }

    async fn run(&self, args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
        let cmd = require_str(&args, "cmd")?.to_string();
        let timeout = Duration::from_secs(optional_u64(&args, "timeout", 10).max(1));

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| ToolError::Timeout(timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(json!({
            "stdout": truncate_back(&stdout, MAX_TEXT_BYTES),
            "stderr": truncate_back(&stderr, MAX_STDERR_BYTES),
            "returncode": output.status.code(),
        }))
    }
}

// --- mcp.git.status ---

struct GitStatusTool;

#[async_trait]
impl Tool for GitStatusTool {
    fn name(&self) -> &str {
        "mcp.git.status"
    }

    fn description(&self) -> &str {
        "Porcelain git status of a repository."
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": { "repo": { "type": "string" } },
            "required": ["repo"]
        }))
    }

    async fn run(&self, args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
        let repo = require_str(&args, "repo")?.to_string();
        let output = tokio::process::Command::new("git")
            .args(["status", "--porcelain=v1"])
            .current_dir(&repo)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(ToolError::ExecutionFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(json!({ "stdout": String::from_utf8_lossy(&output.stdout) }))
    }
}

// --- math.eval ---

struct MathEvalTool;

#[async_trait]
impl Tool for MathEvalTool {
    fn name(&self) -> &str {
        "math.eval"
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression (+, -, *, /, parentheses)."
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": { "expr": { "type": "string" } },
            "required": ["expr"]
        }))
    }

    async fn run(&self, args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
        let expr = require_str(&args, "expr")?;
        let value = eval_expr(expr)
            .map_err(|e| ToolError::InvalidParameters(format!("bad expression: {e}")))?;
        Ok(json!({ "value": value }))
    }
}

/// Minimal recursive-descent arithmetic evaluator.
fn eval_expr(input: &str) -> Result<f64, String> {
    let tokens: Vec<char> = input.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pos = 0;
    let value = parse_sum(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(format!("unexpected '{}' at {}", tokens[pos], pos));
    }
    Ok(value)
}

fn parse_sum(tokens: &[char], pos: &mut usize) -> Result<f64, String> {
    let mut acc = parse_product(tokens, pos)?;
    while let Some(&op) = tokens.get(*pos) {
        match op {
            '+' => {
                *pos += 1;
                acc += parse_product(tokens, pos)?;
            }
            '-' => {
                *pos += 1;
                acc -= parse_product(tokens, pos)?;
            }
            _ => break,
        }
    }
    Ok(acc)
}

fn parse_product(tokens: &[char], pos: &mut usize) -> Result<f64, String> {
    let mut acc = parse_atom(tokens, pos)?;
    while let Some(&op) = tokens.get(*pos) {
        match op {
            '*' => {
                *pos += 1;
                acc *= parse_atom(tokens, pos)?;
            }
            '/' => {
                *pos += 1;
                let rhs = parse_atom(tokens, pos)?;
                if rhs == 0.0 {
                    return Err("division by zero".into());
                }
                acc /= rhs;
            }
            _ => break,
        }
    }
    Ok(acc)
}

fn parse_atom(tokens: &[char], pos: &mut usize) -> Result<f64, String> {
    match tokens.get(*pos) {
        Some('-') => {
            *pos += 1;
            Ok(-parse_atom(tokens, pos)?)
        }
        Some('(') => {
            *pos += 1;
            let value = parse_sum(tokens, pos)?;
            if tokens.get(*pos) != Some(&')') {
                return Err("missing closing parenthesis".into());
            }
            *pos += 1;
            Ok(value)
        }
        Some(c) if c.is_ascii_digit() || *c == '.' => {
            let start = *pos;
            while tokens
                .get(*pos)
                .is_some_and(|c| c.is_ascii_digit() || *c == '.')
            {
                *pos += 1;
            }
            let text: String = tokens[start..*pos].iter().collect();
            text.parse().map_err(|_| format!("bad number '{text}'"))
        }
        Some(c) => Err(format!("unexpected '{c}'")),
        None => Err("unexpected end of expression".into()),
    }
}

// --- session.recall ---

struct SessionRecallTool {
    store: Arc<Store>,
}

#[async_trait]
impl Tool for SessionRecallTool {
    fn name(&self) -> &str {
        "session.recall"
    }

    fn description(&self) -> &str {
        "Recall values persisted for this thread (one key, or the most recent entries)."
    }

    async fn run(&self, args: Value, ctx: &RunContext) -> Result<Value, ToolError> {
        let thread_id = ctx.thread_id.as_deref();
        if let Some(key) = args.get("key").and_then(|v| v.as_str()) {
            let value = self
                .store
                .kv_get(thread_id, key)
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
            return Ok(json!({ "key": key, "value": value }));
        }
        let limit = optional_u64(&args, "limit", 20) as usize;
        let entries: Vec<Value> = self
            .store
            .kv_recent(thread_id, limit)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
            .into_iter()
            .map(|(key, value, created_at)| json!({
                "key": key, "value": value, "created_at": created_at
            }))
            .collect();
        Ok(json!({ "entries": entries }))
    }
}

// --- msg.send / msg.fetch ---

struct MsgSendTool {
    store: Arc<Store>,
}

#[async_trait]
impl Tool for MsgSendTool {
    fn name(&self) -> &str {
        "msg.send"
    }

    fn description(&self) -> &str {
        "Leave a message for another agent in this thread."
    }

    async fn run(&self, args: Value, ctx: &RunContext) -> Result<Value, ToolError> {
        let thread_id = ctx
            .thread_id
            .as_deref()
            .ok_or_else(|| ToolError::InvalidParameters("no thread to send within".into()))?;
        let recipient = require_str(&args, "recipient")?;
        let content = require_str(&args, "content")?;
        let sender = args
            .get("sender")
            .and_then(|v| v.as_str())
            .unwrap_or("agent");
        self.store
            .save_message(thread_id, sender, recipient, content)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(json!({ "ok": true }))
    }
}

struct MsgFetchTool {
    store: Arc<Store>,
}

#[async_trait]
impl Tool for MsgFetchTool {
    fn name(&self) -> &str {
        "msg.fetch"
    }

    fn description(&self) -> &str {
        "Fetch messages addressed to a recipient in this thread."
    }

    async fn run(&self, args: Value, ctx: &RunContext) -> Result<Value, ToolError> {
        let thread_id = ctx
            .thread_id
            .as_deref()
            .ok_or_else(|| ToolError::InvalidParameters("no thread to fetch from".into()))?;
        let recipient = require_str(&args, "recipient")?;
        let messages = self
            .store
            .fetch_messages(thread_id, recipient)
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(json!({ "messages": messages }))
    }
}

// --- pdf.text ---

struct PdfTextTool;

#[async_trait]
impl Tool for PdfTextTool {
    fn name(&self) -> &str {
        "pdf.text"
    }

    fn description(&self) -> &str {
        "Extract the text content of a PDF file."
    }

    fn input_schema(&self) -> Option<Value> {
        Some(json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        }))
    }

    async fn run(&self, args: Value, _ctx: &RunContext) -> Result<Value, ToolError> {
        let path = require_str(&args, "path")?.to_string();
        let text = tokio::task::spawn_blocking(move || pdf_extract::extract_text(&path))
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("join error: {e}")))?
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(json!({ "text": truncate_front(&text, MAX_TEXT_BYTES) }))
    }
}

// --- agent.delegate ---

struct DelegateTool {
    runtime: Weak<Runtime>,
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        "agent.delegate"
    }

    fn description(&self) -> &str {
        "Hand a prompt (or explicit steps) to a nested executor run."
    }

    async fn run(&self, args: Value, ctx: &RunContext) -> Result<Value, ToolError> {
        let runtime = self
            .runtime
            .upgrade()
            .ok_or_else(|| ToolError::ExecutionFailed("runtime is shutting down".into()))?;
        let prompt = args
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let thread_id = args
            .get("thread_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| ctx.thread_id.clone());
        let tags: Vec<String> = args
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_else(|| ctx.tags.clone());
        let steps = args
            .get("steps")
            .and_then(|v| v.as_array())
            .map(|a| a.to_vec());

        let report = runtime
            .execute_steps(&prompt, steps, thread_id, tags)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        serde_json::to_value(report).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn math_eval_handles_precedence_and_parens() {
        assert_eq!(eval_expr("1 + 2 * 3").unwrap(), 7.0);
        assert_eq!(eval_expr("(1 + 2) * 3").unwrap(), 9.0);
        assert_eq!(eval_expr("-4 + 10 / 2").unwrap(), 1.0);
        assert_eq!(eval_expr("2.5 * 4").unwrap(), 10.0);
    }

    #[test]
    fn math_eval_rejects_garbage() {
        assert!(eval_expr("1 +").is_err());
        assert!(eval_expr("(1").is_err());
        assert!(eval_expr("1 / 0").is_err());
        assert!(eval_expr("two").is_err());
    }

    #[test]
    fn truncation_is_char_safe() {
        assert_eq!(truncate_front("hello", 3), "hel");
        assert_eq!(truncate_back("hello", 3), "llo");
        assert_eq!(truncate_front("héllo", 2), "hé");
        assert_eq!(truncate_back("ab", 10), "ab");
    }

    #[tokio::test]
    async fn fs_read_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, "contents").unwrap();
        let out = FsReadTool
            .run(
                json!({"path": path.display().to_string()}),
                &RunContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(out["text"], "contents");
    }

    #[tokio::test]
    async fn shell_run_captures_output() {
        let out = ShellRunTool
            .run(json!({"cmd": "echo out; echo err >&2; exit 3"}), &RunContext::default())
            .await
            .unwrap();
        assert_eq!(out["stdout"].as_str().unwrap().trim(), "out");
        assert_eq!(out["stderr"].as_str().unwrap().trim(), "err");
        assert_eq!(out["returncode"], 3);
    }

    #[tokio::test]
    async fn shell_run_times_out() {
        let err = ShellRunTool
            .run(json!({"cmd": "sleep 5", "timeout": 1}), &RunContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[tokio::test]
    async fn sqlite_query_returns_columns_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.sqlite3");
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute_batch(
            "CREATE TABLE items(id INTEGER, name TEXT); \
             INSERT INTO items VALUES (1, 'one'), (2, 'two');",
        )
        .unwrap();
        drop(conn);

        let out = SqliteQueryTool
            .run(
                json!({
                    "db_path": db.display().to_string(),
                    "query": "SELECT id, name FROM items ORDER BY id"
                }),
                &RunContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(out["columns"], json!(["id", "name"]));
        assert_eq!(out["rows"], json!([[1, "one"], [2, "two"]]));
    }

    #[tokio::test]
    async fn session_tools_round_trip() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let ctx = RunContext::new(Some("th".into()), String::new(), vec![]);

        store.kv_put(Some("th"), "step:web_fetch", "{}").unwrap();
        let recall = SessionRecallTool {
            store: store.clone(),
        };
        let out = recall
            .run(json!({"key": "step:web_fetch"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["value"], "{}");

        let send = MsgSendTool {
            store: store.clone(),
        };
        send.run(json!({"recipient": "worker", "content": "hi"}), &ctx)
            .await
            .unwrap();
        let fetch = MsgFetchTool { store };
        let out = fetch.run(json!({"recipient": "worker"}), &ctx).await.unwrap();
        assert_eq!(out["messages"][0]["content"], "hi");
    }

    #[tokio::test]
    async fn msg_send_requires_thread() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let send = MsgSendTool { store };
        let err = send
            .run(
                json!({"recipient": "r", "content": "c"}),
                &RunContext::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParameters(_)));
    }
}
