pub mod root_folder;
pub mod season;
pub mod series;
pub mod settings;

use chrono::Utc;

/// Storage timestamps are RFC 3339 strings, matching the JSON columns.
pub(crate) fn now_ts() -> String {
    Utc::now().to_rfc3339()
}
