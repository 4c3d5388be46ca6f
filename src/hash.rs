//! The content hashing engine.
//!
//! Hashes are value-based, never identity-based: two task instances built
//! through different syntactic paths but holding equal inputs must hash
//! identically. Values are encoded into canonical CBOR and folded into a
//! BLAKE3 digest; callables hash by their reproducible fingerprint, and
//! content-addressable values delegate to their own `content_hash`.

use crate::error::HashError;
use crate::value::Value;

/// A 32-byte BLAKE3 hash.
///
/// Serves as the fingerprint of a field value, of a whole task instance, and
/// of a task specification's identity in the construction cache.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Incremental BLAKE3 digest over a sequence of labelled parts.
#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub(crate) fn update(&mut self, bytes: impl AsRef<[u8]>) -> &mut Self {
        self.0.update(bytes.as_ref());
        self
    }
}

impl From<Blake3Hasher> for Hash32 {
    fn from(value: Blake3Hasher) -> Self {
        let bytes: [u8; 32] = value.0.finalize().into();
        Hash32::from(bytes)
    }
}

/// Computes the content hash of a single field value.
///
/// `field` is only used to report which field held an unhashable value.
pub fn hash_value(field: &str, value: &Value) -> Result<Hash32, HashError> {
    let tree = encode(field, value)?;

    let mut buffer = Vec::new();
    ciborium::into_writer(&tree, &mut buffer).map_err(|e| HashError::Encode(e.to_string()))?;

    Ok(Hash32::hash(&buffer))
}

/// Hashes a value by its stable identity token instead of its content.
///
/// This is the `by-equality` hashing policy: for callables the token is the
/// fingerprint, so a constructor closure hashes the same as any other
/// closure that compares equal to it. Values without an identity token fall
/// back to content hashing.
pub fn hash_identity(field: &str, value: &Value) -> Result<Hash32, HashError> {
    match value {
        Value::Callable(callable) => {
            let mut hasher = Blake3Hasher::default();
            hasher.update(b"eq:callable:").update(callable.fingerprint());
            Ok(hasher.into())
        }
        other => hash_value(field, other),
    }
}

/// Folds ordered per-field hashes into a single instance digest.
pub fn fold_fields<'a>(parts: impl IntoIterator<Item = (&'a str, Hash32)>) -> Hash32 {
    let mut hasher = Blake3Hasher::default();

    for (name, hash) in parts {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash.as_bytes());
    }

    hasher.into()
}

// Canonical CBOR tree for a value. Every variant is wrapped in a
// [tag, payload] pair so that e.g. a list and a tuple with equal elements
// never collide.
fn encode(field: &str, value: &Value) -> Result<ciborium::Value, HashError> {
    use ciborium::Value as Cbor;

    let tagged = |tag: &str, payload: Cbor| {
        Cbor::Array(vec![Cbor::Text(tag.to_string()), payload])
    };

    Ok(match value {
        Value::Nothing => tagged("nothing", Cbor::Null),
        Value::Bool(b) => tagged("bool", Cbor::Bool(*b)),
        Value::Int(i) => tagged("int", Cbor::Integer((*i).into())),
        Value::Float(x) => {
            if x.is_nan() {
                return Err(HashError::Unhashable {
                    field: field.to_string(),
                    reason: "NaN has no canonical encoding".to_string(),
                });
            }
            tagged("float", Cbor::Float(*x))
        }
        Value::Str(s) => tagged("str", Cbor::Text(s.clone())),
        Value::List(items) => tagged(
            "list",
            Cbor::Array(
                items
                    .iter()
                    .map(|item| encode(field, item))
                    .collect::<Result<_, _>>()?,
            ),
        ),
        Value::Tuple(items) => tagged(
            "tuple",
            Cbor::Array(
                items
                    .iter()
                    .map(|item| encode(field, item))
                    .collect::<Result<_, _>>()?,
            ),
        ),
        Value::Callable(callable) => {
            tagged("callable", Cbor::Text(callable.fingerprint().to_string()))
        }
        Value::Custom(custom) => tagged("content", Cbor::Text(custom.content_hash()?.to_hex())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Callable;

    #[test]
    fn equal_values_hash_equal() {
        let a = Value::from(vec![1, 2, 3]);
        let b = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(hash_value("x", &a).unwrap(), hash_value("x", &b).unwrap());
    }

    #[test]
    fn list_and_tuple_never_collide() {
        let list = Value::List(vec![Value::Int(1)]);
        let tuple = Value::Tuple(vec![Value::Int(1)]);
        assert_ne!(
            hash_value("x", &list).unwrap(),
            hash_value("x", &tuple).unwrap(),
        );
    }

    #[test]
    fn int_and_float_never_collide() {
        assert_ne!(
            hash_value("x", &Value::Int(1)).unwrap(),
            hash_value("x", &Value::Float(1.0)).unwrap(),
        );
    }

    #[test]
    fn nan_is_unhashable() {
        let err = hash_value("x", &Value::Float(f64::NAN)).unwrap_err();
        assert!(err.to_string().contains("Unhashable value in field 'x'"));
    }

    #[test]
    fn redefined_callable_keeps_hash() {
        // Two separately created closures with the same fingerprint stand
        // for the same semantic function.
        let first = Value::Callable(Callable::new("add/v1", |_| Ok(vec![])));
        let second = Value::Callable(Callable::new("add/v1", |_| Ok(vec![])));
        assert_eq!(
            hash_value("function", &first).unwrap(),
            hash_value("function", &second).unwrap(),
        );
    }

    #[test]
    fn identity_hash_differs_from_value_hash() {
        let value = Value::Callable(Callable::reference("ctor/v1"));
        assert_ne!(
            hash_identity("constructor", &value).unwrap(),
            hash_value("constructor", &value).unwrap(),
        );
    }

    #[test]
    fn fold_is_order_sensitive() {
        let a = Hash32::hash(b"a");
        let b = Hash32::hash(b"b");
        assert_ne!(
            fold_fields([("x", a), ("y", b)]),
            fold_fields([("y", b), ("x", a)]),
        );
    }
}
