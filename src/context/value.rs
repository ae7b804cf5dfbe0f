//! Entry values for [`Context`](super::Context).

use serde::{Deserialize, Serialize};

/// One context entry.
///
/// Serialized without a type tag, so a context renders as the plain JSON
/// object a reader would expect (`{"tenant": "acme", "attempt": 3}`). On the
/// way back in, a JSON number without a fractional part becomes an
/// [`Integer`](Self::Integer); anything that is not a scalar lands in
/// [`Json`](Self::Json).
///
/// Typed reads go through [`Context::get_str`](super::Context::get_str) and
/// its siblings rather than matching on the variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    /// A boolean flag.
    Flag(bool),
    /// A signed integer; smaller integer types widen into it.
    Integer(i64),
    /// A floating point number.
    Float(f64),
    /// Text such as an id or a tenant name.
    Text(String),
    /// Any other structured payload.
    Json(serde_json::Value),
}

macro_rules! context_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for ContextValue {
                fn from(v: $ty) -> Self {
                    Self::$variant(v.into())
                }
            }
        )*
    };
}

context_value_from! {
    bool => Flag,
    i32 => Integer,
    u32 => Integer,
    i64 => Integer,
    f64 => Float,
    String => Text,
    serde_json::Value => Json,
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_as_bare_json() {
        assert_eq!(serde_json::to_string(&ContextValue::from("acme")).unwrap(), "\"acme\"");
        assert_eq!(serde_json::to_string(&ContextValue::from(7)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&ContextValue::from(false)).unwrap(), "false");
    }

    #[test]
    fn test_deserialize_picks_narrowest_variant() {
        let parsed: Vec<ContextValue> =
            serde_json::from_str(r#"[true, 3, 2.5, "eu", {"shard": 4}]"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                ContextValue::Flag(true),
                ContextValue::Integer(3),
                ContextValue::Float(2.5),
                ContextValue::Text("eu".to_string()),
                ContextValue::Json(serde_json::json!({"shard": 4})),
            ]
        );
    }
}
