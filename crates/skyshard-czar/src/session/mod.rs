//! User-facing session layer: command recognition, per-query messages and
//! the user query lifecycle object.

pub mod messages;
pub mod query_type;
pub mod user_query;

pub use messages::{MessageStore, QueryMessage, Severity};
pub use query_type::{
    CommandQuery, is_process_list_select, is_process_list_table, is_select, recognize,
};
pub use user_query::{QueryState, UserQuery};
