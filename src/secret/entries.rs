//! `KEY=VALUE` line format shared by the encrypted body and plaintext files.

use crate::secret::error::{SecretError, SecretResult};
use std::collections::BTreeMap;

pub type Entries = BTreeMap<String, String>;

/// Serialize as newline-separated `KEY=VALUE` lines, sorted by key.
pub fn serialize(entries: &Entries) -> String {
    entries
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Reject anything the line format cannot carry without escaping.
pub fn validate(key: &str, value: &str) -> SecretResult<()> {
    let invalid = |reason: &str| SecretError::InvalidEntry {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.trim().is_empty() {
        return Err(invalid("key is empty"));
    }
    if key.contains('=') {
        return Err(invalid("key contains '='"));
    }
    if key.contains(['\n', '\r']) {
        return Err(invalid("key contains a line break"));
    }
    if value.contains(['\n', '\r']) {
        return Err(invalid("value contains a line break"));
    }
    Ok(())
}

/// Strict parse of a decrypted body. Every non-blank line must be `KEY=VALUE`;
/// anything else means the decrypt produced garbage.
pub fn parse_body(body: &str) -> SecretResult<Entries> {
    let mut entries = Entries::new();
    for (index, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            SecretError::DecryptionFailed(format!("line {} is not KEY=VALUE", index + 1))
        })?;
        if key.is_empty() {
            return Err(SecretError::DecryptionFailed(format!(
                "line {} has an empty key",
                index + 1
            )));
        }
        entries.insert(key.to_string(), value.to_string());
    }
    Ok(entries)
}

/// Lenient parse of a hand-written plaintext file: blank lines and `#` comments
/// are skipped, keys and values are trimmed and one layer of matching quotes
/// is stripped from the value. Lines without `=` are skipped.
pub fn parse_plaintext(text: &str) -> Entries {
    let mut entries = Entries::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            tracing::warn!(line = index + 1, "Skipping plaintext line without '='");
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            tracing::warn!(line = index + 1, "Skipping plaintext line with empty key");
            continue;
        }
        entries.insert(key.to_string(), strip_quotes(value.trim()).to_string());
    }
    entries
}

fn strip_quotes(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_is_sorted() {
        let mut entries = Entries::new();
        entries.insert("ZETA".into(), "1".into());
        entries.insert("ALPHA".into(), "2".into());
        assert_eq!(serialize(&entries), "ALPHA=2\nZETA=1");
    }

    #[test]
    fn test_body_value_may_contain_equals() {
        let entries = parse_body("URL=https://x?a=b\n\nK=").unwrap();
        assert_eq!(entries["URL"], "https://x?a=b");
        assert_eq!(entries["K"], "");
    }

    #[test]
    fn test_body_rejects_garbage() {
        assert!(matches!(
            parse_body("BOT_TOKEN=1\nnot a pair"),
            Err(SecretError::DecryptionFailed(_))
        ));
        assert!(matches!(
            parse_body("=value"),
            Err(SecretError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_plaintext_comments_and_quotes() {
        let text = r#"
# telegram credentials
BOT_TOKEN="123:abc"
CHANNEL_ID = '-100555'
  API_HASH=plain
MISMATCHED="half'
no separator here
"#;
        let entries = parse_plaintext(text);
        assert_eq!(entries.len(), 4);
        assert_eq!(entries["BOT_TOKEN"], "123:abc");
        assert_eq!(entries["CHANNEL_ID"], "-100555");
        assert_eq!(entries["API_HASH"], "plain");
        assert_eq!(entries["MISMATCHED"], "\"half'");
    }

    #[test]
    fn test_only_one_quote_layer_is_stripped() {
        let entries = parse_plaintext("K=\"'inner'\"");
        assert_eq!(entries["K"], "'inner'");
    }

    #[test]
    fn test_validate() {
        assert!(validate("KEY", "value=with=equals").is_ok());
        assert!(validate("", "v").is_err());
        assert!(validate("A=B", "v").is_err());
        assert!(validate("KEY", "two\nlines").is_err());
    }
}
