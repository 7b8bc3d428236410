//! Object naming for staged resources.

use uuid::Uuid;

/// Request-scoped namespace: every staged object of one training call shares it.
///
/// Names look like `RF_3F2A9C0B41D7_TABLE` or `RF_3F2A9C0B41D7_CHUNK_2`, so
/// concurrent calls with separate prefixes never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPrefix {
    value: String,
}

impl RequestPrefix {
    pub fn new(prefix: &str) -> Self {
        let prefix: String = prefix
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect::<String>()
            .to_ascii_uppercase();
        let prefix = if prefix.is_empty() { "RF".to_string() } else { prefix };
        let unique = Uuid::new_v4().simple().to_string().to_ascii_uppercase();
        Self {
            value: format!("{prefix}_{}", &unique[..12]),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// `<prefix>_<KIND>`.
    pub fn object(&self, kind: &str) -> String {
        format!("{}_{}", self.value, kind.to_ascii_uppercase())
    }

    /// `<prefix>_<KIND>_<n>`.
    pub fn numbered(&self, kind: &str, n: usize) -> String {
        format!("{}_{n}", self.object(kind))
    }

    /// Whether `name` belongs to this namespace.
    pub fn owns(&self, name: &str) -> bool {
        name.strip_prefix(self.value.as_str())
            .is_some_and(|rest| rest.starts_with('_'))
    }
}

/// Unquoted identifiers are plain ASCII words not starting with a digit.
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Whether `name` is already wrapped in double quotes with inner quotes doubled.
pub fn is_quoted(name: &str) -> bool {
    name.len() >= 2
        && name.starts_with('"')
        && name.ends_with('"')
        && !name[1..name.len() - 1].replace("\"\"", "").contains('"')
}

/// Double-quote an identifier for SQL, leaving already quoted names alone.
pub fn quote_identifier(name: &str) -> String {
    if is_quoted(name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Inverse of [`quote_identifier`]. Plain names come back unchanged.
pub fn unquote_identifier(name: &str) -> String {
    if is_quoted(name) {
        name[1..name.len() - 1].replace("\"\"", "\"")
    } else {
        name.to_string()
    }
}

/// Join identifiers; the result is quoted when any part was.
pub fn concat_identifiers(parts: &[&str]) -> String {
    let any_quoted = parts.iter().any(|part| is_quoted(part));
    let joined: String = parts.iter().map(|part| unquote_identifier(part)).collect();
    if any_quoted {
        quote_identifier(&joined)
    } else {
        joined
    }
}

/// Names usable as stage or staged-file names (and therefore as path segments).
pub fn is_safe_object_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
