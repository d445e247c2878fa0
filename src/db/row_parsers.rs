use uuid::Uuid;

use crate::errors::AppError;

/// Ids are stored as hyphenated text.
pub fn parse_uuid(s: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(s.trim()).map_err(|e| AppError::internal(format!("invalid uuid '{}': {}", s, e)))
}

/// `LIKE` pattern matching `fragment` anywhere, with wildcards in the input escaped (`ESCAPE '\'`).
pub fn contains_pattern(fragment: &str) -> String {
    let escaped: String = fragment
        .chars()
        .flat_map(|c| match c {
            '%' | '_' | '\\' => vec!['\\', c],
            _ => vec![c],
        })
        .collect();
    format!("%{}%", escaped)
}
