//! Deterministic storage keys for a shared key-value namespace.
//!
//! A key type declares its [`KeySchema`] (separator + optional prefix) once, as
//! a `const`. Packing joins the prefix and every encoded field with the
//! separator. Because neither the prefix nor any encoded field may contain the
//! separator, a packed key always splits back into exactly the parts it was
//! built from; no escaping is needed.
//!
//! ```
//! use courier_core::key::{KeySchema, StorageKey};
//!
//! struct SessionKey {
//!     chat_id: i64,
//!     active: bool,
//! }
//!
//! impl StorageKey for SessionKey {
//!     const SCHEMA: KeySchema = KeySchema::new(":", Some("sessions"));
//!
//!     fn parts(&self) -> Vec<(&'static str, String)> {
//!         courier_core::key_parts![("chat_id", self.chat_id), ("active", self.active)]
//!     }
//! }
//!
//! let key = SessionKey { chat_id: 42, active: true };
//! assert_eq!(key.pack().unwrap(), "sessions:42:1");
//! ```

use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_SEPARATOR: &str = ":";

/// Definition-time schema error. `Copy` so it can be produced in const context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KeySchemaError {
    #[error("key separator must not be empty")]
    EmptySeparator,

    #[error("separator symbol {separator:?} can not be used inside prefix {prefix:?}")]
    SeparatorInPrefix {
        separator: &'static str,
        prefix: &'static str,
    },
}

/// Key construction error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error(transparent)]
    Schema(#[from] KeySchemaError),

    #[error("separator symbol {separator:?} can not be used in value {field}={value:?}")]
    SeparatorInValue {
        separator: &'static str,
        field: &'static str,
        value: String,
    },
}

/// Separator and prefix shared by every key of one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySchema {
    separator: &'static str,
    prefix: Option<&'static str>,
}

impl KeySchema {
    /// Validate and build a schema.
    pub const fn try_new(
        separator: &'static str,
        prefix: Option<&'static str>,
    ) -> Result<Self, KeySchemaError> {
        if separator.is_empty() {
            return Err(KeySchemaError::EmptySeparator);
        }
        if let Some(prefix) = prefix {
            if contains(prefix, separator) {
                return Err(KeySchemaError::SeparatorInPrefix { separator, prefix });
            }
        }
        Ok(Self { separator, prefix })
    }

    /// Build a schema, panicking on an invalid declaration.
    ///
    /// Used in `const` items, where the panic surfaces as a compile error.
    pub const fn new(separator: &'static str, prefix: Option<&'static str>) -> Self {
        match Self::try_new(separator, prefix) {
            Ok(schema) => schema,
            Err(KeySchemaError::EmptySeparator) => panic!("key separator must not be empty"),
            Err(KeySchemaError::SeparatorInPrefix { .. }) => {
                panic!("key separator can not be used inside the key prefix")
            }
        }
    }

    /// Schema with the default `:` separator.
    pub const fn prefixed(prefix: &'static str) -> Self {
        Self::new(DEFAULT_SEPARATOR, Some(prefix))
    }

    pub const fn separator(&self) -> &'static str {
        self.separator
    }

    pub const fn prefix(&self) -> Option<&'static str> {
        self.prefix
    }

    /// Join the prefix and the encoded parts.
    ///
    /// Fails without producing any output if a part contains the separator.
    pub fn pack(&self, parts: &[(&'static str, String)]) -> Result<String, KeyError> {
        let mut segments: Vec<&str> = Vec::with_capacity(parts.len() + 1);
        if let Some(prefix) = self.prefix {
            if !prefix.is_empty() {
                segments.push(prefix);
            }
        }
        for (field, encoded) in parts {
            if encoded.contains(self.separator) {
                return Err(KeyError::SeparatorInValue {
                    separator: self.separator,
                    field: *field,
                    value: encoded.clone(),
                });
            }
            segments.push(encoded);
        }
        Ok(segments.join(self.separator))
    }
}

impl Default for KeySchema {
    fn default() -> Self {
        Self::new(DEFAULT_SEPARATOR, None)
    }
}

/// A structured key that packs into a single delimited string.
pub trait StorageKey {
    const SCHEMA: KeySchema;

    /// Field name and encoded value, in declaration order.
    fn parts(&self) -> Vec<(&'static str, String)>;

    fn pack(&self) -> Result<String, KeyError> {
        Self::SCHEMA.pack(&self.parts())
    }
}

/// Encoding of a single key field.
pub trait KeyPart {
    fn encode_key(&self) -> String;
}

/// Build the `parts()` vector of a [`StorageKey`] from `(name, value)` pairs.
#[macro_export]
macro_rules! key_parts {
    ($(($name:literal, $value:expr)),* $(,)?) => {
        vec![$(($name, $crate::key::KeyPart::encode_key(&$value))),*]
    };
}

impl KeyPart for bool {
    fn encode_key(&self) -> String {
        if *self { "1" } else { "0" }.to_string()
    }
}

impl KeyPart for str {
    fn encode_key(&self) -> String {
        self.to_string()
    }
}

impl KeyPart for String {
    fn encode_key(&self) -> String {
        self.clone()
    }
}

impl KeyPart for Uuid {
    fn encode_key(&self) -> String {
        self.simple().to_string()
    }
}

impl<T: KeyPart> KeyPart for Option<T> {
    fn encode_key(&self) -> String {
        match self {
            Some(value) => value.encode_key(),
            None => "null".to_string(),
        }
    }
}

impl<T: KeyPart + ?Sized> KeyPart for &T {
    fn encode_key(&self) -> String {
        (**self).encode_key()
    }
}

macro_rules! impl_display_key_part {
    ($($t:ty),*) => {
        $(impl KeyPart for $t {
            fn encode_key(&self) -> String {
                self.to_string()
            }
        })*
    };
}

impl_display_key_part!(i8, i16, i32, i64, u8, u16, u32, u64, usize, char);

const fn contains(haystack: &str, needle: &str) -> bool {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.len() > h.len() {
        return false;
    }
    let mut i = 0;
    while i + n.len() <= h.len() {
        let mut j = 0;
        while j < n.len() && h[i + j] == n[j] {
            j += 1;
        }
        if j == n.len() {
            return true;
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy)]
    enum Shard {
        Primary,
        Replica,
    }

    impl KeyPart for Shard {
        fn encode_key(&self) -> String {
            match self {
                Shard::Primary => "primary",
                Shard::Replica => "replica",
            }
            .to_string()
        }
    }

    struct ProbeKey {
        name: String,
        shard: Shard,
        owner: Option<Uuid>,
        enabled: bool,
    }

    impl StorageKey for ProbeKey {
        const SCHEMA: KeySchema = KeySchema::prefixed("probe");

        fn parts(&self) -> Vec<(&'static str, String)> {
            key_parts![
                ("name", self.name),
                ("shard", self.shard),
                ("owner", self.owner),
                ("enabled", self.enabled),
            ]
        }
    }

    #[test]
    fn prefix_with_separator_is_rejected() {
        let err = KeySchema::try_new(":", Some("users:v2")).unwrap_err();
        assert_eq!(
            err,
            KeySchemaError::SeparatorInPrefix {
                separator: ":",
                prefix: "users:v2"
            }
        );
        assert!(KeySchema::try_new("", None).is_err());
        assert!(KeySchema::try_new("|", Some("users:v2")).is_ok());
    }

    #[test]
    #[should_panic(expected = "inside the key prefix")]
    fn new_panics_on_invalid_declaration() {
        let _ = KeySchema::new("/", Some("a/b"));
    }

    #[test]
    fn packs_prefix_and_encoded_fields() {
        let owner = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        let key = ProbeKey {
            name: "alpha".into(),
            shard: Shard::Replica,
            owner: Some(owner),
            enabled: true,
        };
        assert_eq!(
            key.pack().unwrap(),
            "probe:alpha:replica:67e5504410b1426f9247bb680e5fe0c8:1"
        );

        let key = ProbeKey {
            name: "beta".into(),
            shard: Shard::Primary,
            owner: None,
            enabled: false,
        };
        assert_eq!(key.pack().unwrap(), "probe:beta:primary:null:0");
    }

    #[test]
    fn value_with_separator_fails_without_output() {
        let key = ProbeKey {
            name: "a:b".into(),
            shard: Shard::Primary,
            owner: None,
            enabled: true,
        };
        let err = key.pack().unwrap_err();
        assert_eq!(
            err,
            KeyError::SeparatorInValue {
                separator: ":",
                field: "name",
                value: "a:b".into()
            }
        );
        // Deterministic: the same input fails the same way.
        assert_eq!(key.pack().unwrap_err(), err);
    }

    #[test]
    fn schema_without_prefix_packs_only_fields() {
        let schema = KeySchema::default();
        let packed = schema
            .pack(&[("a", 1i64.encode_key()), ("b", "x".encode_key())])
            .unwrap();
        assert_eq!(packed, "1:x");
    }

    proptest! {
        #[test]
        fn packed_keys_split_back_into_parts(parts in proptest::collection::vec("[a-z0-9_\\-]{0,12}", 1..6)) {
            let schema = KeySchema::prefixed("prop");
            let named: Vec<(&'static str, String)> = parts.iter().map(|p| ("part", p.clone())).collect();
            let packed = schema.pack(&named).unwrap();
            let mut split: Vec<&str> = packed.split(':').collect();
            prop_assert_eq!(split.remove(0), "prop");
            prop_assert_eq!(split, parts.iter().map(String::as_str).collect::<Vec<_>>());
        }

        #[test]
        fn any_part_containing_separator_is_rejected(left in "[a-z]{0,6}", right in "[a-z]{0,6}") {
            let schema = KeySchema::prefixed("prop");
            let bad = format!("{left}:{right}");
            prop_assert!(schema.pack(&[("ok", "fine".into()), ("bad", bad)]).is_err());
        }
    }
}
