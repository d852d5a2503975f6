//! In-band command recognition
//!
//! Before any SQL goes through the analyzer, the raw statement is matched
//! against the command patterns the czar handles itself: catalog DDL
//! forwarding, cache flushes, process-list inspection, async submission and
//! cancellation. Recognizers are case-insensitive, tolerate backtick or
//! double-quote identifier quoting and a trailing semicolon.

use once_cell::sync::Lazy;
use regex::Regex;
use skyshard_common::QueryId;

/// A statement the czar executes itself instead of dispatching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandQuery {
    DropDb { db: String },
    DropTable { db: Option<String>, table: String },
    FlushChunksCache { db: Option<String> },
    ShowProcessList { full: bool },
    /// `SUBMIT <select>`: asynchronous execution of the inner statement.
    Submit { inner: String },
    /// `SELECT * FROM QSERV_RESULT(<id>)`: fetch of a submitted result.
    SelectResult { query_id: QueryId },
    Kill { thread_id: u64 },
    CancelQuery { query_id: QueryId },
    Call { body: String },
}

macro_rules! command_re {
    ($name:ident, $pattern:literal) => {
        static $name: Lazy<Regex> = Lazy::new(|| {
            #[allow(clippy::unwrap_used)]
            Regex::new($pattern).unwrap()
        });
    };
}

// DROP {DATABASE|SCHEMA} db; name may be quoted, group 2 is the name.
command_re!(
    DROP_DB_RE,
    r#"(?i)^drop\s+(database|schema)\s+["`]?(\w+)["`]?\s*;?\s*$"#
);
// DROP TABLE [db.]table; group 1 is the db, group 2 the table.
command_re!(
    DROP_TABLE_RE,
    r#"(?i)^drop\s+table\s+(?:["`]?(\w+)["`]?\.)?["`]?(\w+)["`]?\s*;?\s*$"#
);
command_re!(SELECT_RE, r"(?i)^select\s+.+$");
// FLUSH QSERV_CHUNKS_CACHE [FOR db]; group 1 is the db.
command_re!(
    FLUSH_RE,
    r#"(?i)^flush\s+qserv_chunks_cache(?:\s+for\s+["`]?(\w+)["`]?)?\s*;?\s*$"#
);
// SHOW [FULL] PROCESSLIST; group 1 non-empty selects the full listing.
command_re!(
    SHOW_PROCESSLIST_RE,
    r"(?i)^show\s+(full\s+)?processlist\s*;?\s*$"
);
// SUBMIT <query>; group 1 is the query without the prefix.
command_re!(SUBMIT_RE, r"(?i)^submit\s+(.+)$");
// SELECT * FROM QSERV_RESULT(12345); group 1 is the query id.
command_re!(
    SELECT_RESULT_RE,
    r"(?i)^select\s+\*\s+from\s+qserv_result\s*\(\s*(\d+)\s*\)\s*;?\s*$"
);
// KILL [QUERY|CONNECTION] 12345; group 1 is the thread id.
command_re!(
    KILL_RE,
    r"(?i)^kill\s+(?:query\s+|connection\s+)?(\d+)\s*;?\s*$"
);
// CANCEL 12345; group 1 is the query id.
command_re!(CANCEL_RE, r"(?i)^cancel\s+(\d+)\s*;?\s*$");
command_re!(CALL_RE, r"(?i)^call\s+(.+?)\s*;?\s*$");

/// Match one statement against the command table. `None` means the
/// statement goes to the analyzer instead.
pub fn recognize(sql: &str) -> Option<CommandQuery> {
    let sql = sql.trim();

    if let Some(captures) = DROP_DB_RE.captures(sql) {
        return Some(CommandQuery::DropDb {
            db: captures.get(2)?.as_str().to_string(),
        });
    }
    if let Some(captures) = DROP_TABLE_RE.captures(sql) {
        return Some(CommandQuery::DropTable {
            db: captures.get(1).map(|m| m.as_str().to_string()),
            table: captures.get(2)?.as_str().to_string(),
        });
    }
    if let Some(captures) = FLUSH_RE.captures(sql) {
        return Some(CommandQuery::FlushChunksCache {
            db: captures.get(1).map(|m| m.as_str().to_string()),
        });
    }
    if let Some(captures) = SHOW_PROCESSLIST_RE.captures(sql) {
        return Some(CommandQuery::ShowProcessList {
            full: captures.get(1).is_some(),
        });
    }
    if let Some(captures) = SELECT_RESULT_RE.captures(sql) {
        let id = captures.get(1)?.as_str().parse().ok()?;
        return Some(CommandQuery::SelectResult {
            query_id: QueryId(id),
        });
    }
    if let Some(captures) = SUBMIT_RE.captures(sql) {
        return Some(CommandQuery::Submit {
            inner: captures.get(1)?.as_str().to_string(),
        });
    }
    if let Some(captures) = KILL_RE.captures(sql) {
        let id = captures.get(1)?.as_str().parse().ok()?;
        return Some(CommandQuery::Kill { thread_id: id });
    }
    if let Some(captures) = CANCEL_RE.captures(sql) {
        let id = captures.get(1)?.as_str().parse().ok()?;
        return Some(CommandQuery::CancelQuery {
            query_id: QueryId(id),
        });
    }
    if let Some(captures) = CALL_RE.captures(sql) {
        return Some(CommandQuery::Call {
            body: captures.get(1)?.as_str().to_string(),
        });
    }
    None
}

/// True for a regular SELECT, excluding the `QSERV_RESULT(...)` fetch form.
pub fn is_select(sql: &str) -> bool {
    let sql = sql.trim();
    SELECT_RE.is_match(sql) && !SELECT_RESULT_RE.is_match(sql)
}

/// True when a table reference names the synthetic process-list table.
pub fn is_process_list_table(db: &str, table: &str) -> bool {
    db.eq_ignore_ascii_case("INFORMATION_SCHEMA") && table.eq_ignore_ascii_case("PROCESSLIST")
}

command_re!(
    PROCESSLIST_SELECT_RE,
    r"(?i)^select\s+.+\s+from\s+information_schema\s*\.\s*processlist\s*;?\s*$"
);

/// True for a SELECT whose sole source is the process-list table; served
/// from the live query registry instead of being dispatched.
pub fn is_process_list_select(sql: &str) -> bool {
    PROCESSLIST_SELECT_RE.is_match(sql.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_database_accepts_quoting_and_semicolon() {
        assert_eq!(
            recognize("DROP DATABASE foo;"),
            Some(CommandQuery::DropDb { db: "foo".to_string() })
        );
        assert_eq!(
            recognize("drop schema `Bar`"),
            Some(CommandQuery::DropDb { db: "Bar".to_string() })
        );
        assert_eq!(recognize("DROP DATABASE"), None);
    }

    #[test]
    fn drop_table_captures_optional_database() {
        assert_eq!(
            recognize("DROP TABLE LSST.Object;"),
            Some(CommandQuery::DropTable {
                db: Some("LSST".to_string()),
                table: "Object".to_string()
            })
        );
        assert_eq!(
            recognize(r#"DROP TABLE "Object""#),
            Some(CommandQuery::DropTable {
                db: None,
                table: "Object".to_string()
            })
        );
    }

    #[test]
    fn flush_cache_scopes_to_a_database() {
        assert_eq!(
            recognize("FLUSH QSERV_CHUNKS_CACHE"),
            Some(CommandQuery::FlushChunksCache { db: None })
        );
        assert_eq!(
            recognize("flush qserv_chunks_cache FOR LSST;"),
            Some(CommandQuery::FlushChunksCache {
                db: Some("LSST".to_string())
            })
        );
    }

    #[test]
    fn processlist_full_flag_is_detected() {
        assert_eq!(
            recognize("SHOW PROCESSLIST"),
            Some(CommandQuery::ShowProcessList { full: false })
        );
        assert_eq!(
            recognize("show full processlist;"),
            Some(CommandQuery::ShowProcessList { full: true })
        );
    }

    #[test]
    fn submit_strips_the_prefix() {
        assert_eq!(
            recognize("SUBMIT SELECT * FROM Object"),
            Some(CommandQuery::Submit {
                inner: "SELECT * FROM Object".to_string()
            })
        );
    }

    #[test]
    fn qserv_result_fetch_is_not_a_plain_select() {
        let sql = "SELECT * FROM QSERV_RESULT(12345)";
        assert_eq!(
            recognize(sql),
            Some(CommandQuery::SelectResult {
                query_id: QueryId(12345)
            })
        );
        assert!(!is_select(sql));
        assert!(is_select("SELECT * FROM Object"));
    }

    #[test]
    fn kill_and_cancel_parse_ids() {
        assert_eq!(
            recognize("KILL QUERY 42"),
            Some(CommandQuery::Kill { thread_id: 42 })
        );
        assert_eq!(
            recognize("kill 42;"),
            Some(CommandQuery::Kill { thread_id: 42 })
        );
        assert_eq!(
            recognize("CANCEL 7"),
            Some(CommandQuery::CancelQuery {
                query_id: QueryId(7)
            })
        );
    }

    #[test]
    fn call_captures_the_body() {
        assert_eq!(
            recognize("CALL qserv_manager('status');"),
            Some(CommandQuery::Call {
                body: "qserv_manager('status')".to_string()
            })
        );
    }

    #[test]
    fn information_schema_processlist_is_recognized() {
        assert!(is_process_list_table("information_schema", "processlist"));
        assert!(!is_process_list_table("LSST", "PROCESSLIST"));
    }
}
