//! SQL and shell quoting for statements sent through the admin client
//!
//! Identifiers are quoted with backticks and string literals escaped before
//! they are interpolated into statements. Database names requested by
//! client applications are validated first and never quoted blindly.

/// Maximum length of a MySQL database name
const MAX_DATABASE_NAME_LEN: usize = 64;

/// Quote a MySQL identifier
///
/// Wraps the name in backticks and doubles any embedded backtick:
/// - `users` -> `` `users` ``
/// - ``my`db`` -> `` `my``db` ``
pub fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Escape a MySQL string literal body
///
/// Backslashes and single quotes are doubled so the value can be placed
/// between single quotes.
pub fn escape_sql_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "''")
}

/// Quote a string literal, including the surrounding quotes
pub fn quote_string(s: &str) -> String {
    format!("'{}'", escape_sql_string(s))
}

/// Account reference in `'user'@'%'` form
pub fn account(username: &str) -> String {
    format!("{}@'%'", quote_string(username))
}

/// Validate a database name requested by a client application
///
/// Accepts 1-64 characters from `[A-Za-z0-9_$]`.
pub fn is_valid_database_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_DATABASE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Escape a string for use as a single shell word
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Statements creating a database and a user confined to it
pub fn scoped_user_statements(database: &str, username: &str, password: &str) -> Vec<String> {
    let db = quote_identifier(database);
    let user = account(username);
    vec![
        format!("CREATE DATABASE IF NOT EXISTS {}", db),
        format!(
            "CREATE USER IF NOT EXISTS {} IDENTIFIED BY {}",
            user,
            quote_string(password)
        ),
        format!("GRANT ALL PRIVILEGES ON {}.* TO {}", db, user),
    ]
}
