//! Dynamic SQL values.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A dynamically-typed SQL value.
///
/// Column buffers, primary keys and link-table rows are all expressed in
/// terms of this enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Feed this value into a hasher.
    ///
    /// Floats hash by bit pattern, so two values that compare equal always
    /// hash equal.
    pub fn hash_into<H: std::hash::Hasher>(&self, hasher: &mut H) {
        use std::hash::Hash;

        match self {
            Value::Null => 0u8.hash(hasher),
            Value::Bool(b) => {
                1u8.hash(hasher);
                b.hash(hasher);
            }
            // Int and BigInt share a tag so 7i32 and 7i64 land on the same key.
            Value::Int(i) => {
                2u8.hash(hasher);
                i64::from(*i).hash(hasher);
            }
            Value::BigInt(i) => {
                2u8.hash(hasher);
                i.hash(hasher);
            }
            Value::Double(f) => {
                3u8.hash(hasher);
                f.to_bits().hash(hasher);
            }
            Value::Decimal(s) => {
                4u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Text(s) => {
                5u8.hash(hasher);
                s.hash(hasher);
            }
            Value::Bytes(b) => {
                6u8.hash(hasher);
                b.hash(hasher);
            }
            Value::Timestamp(ts) => {
                7u8.hash(hasher);
                ts.hash(hasher);
            }
            Value::Uuid(u) => {
                8u8.hash(hasher);
                u.hash(hasher);
            }
        }
    }

    /// Key equality: like `==`, except `Int` and `BigInt` holding the same
    /// number are equal and floats compare by bit pattern, matching
    /// [`hash_into`](Self::hash_into).
    pub fn key_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            _ => match (self.as_i64_key(), other.as_i64_key()) {
                (Some(a), Some(b)) => a == b,
                _ => self == other,
            },
        }
    }

    fn as_i64_key(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::BigInt(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::Decimal(s) => write!(f, "{}", s),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Timestamp(ts) => write!(f, "ts:{}", ts),
            Value::Uuid(u) => {
                for byte in u {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;
    use std::hash::Hasher;

    fn hash_of(v: &Value) -> u64 {
        let mut hasher = DefaultHasher::new();
        v.hash_into(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_from_option() {
        assert_eq!(Value::from(Some(5i64)), Value::BigInt(5));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_int_widths_share_key_identity() {
        assert!(Value::Int(7).key_eq(&Value::BigInt(7)));
        assert_eq!(hash_of(&Value::Int(7)), hash_of(&Value::BigInt(7)));
        assert!(!Value::Int(7).key_eq(&Value::Text("7".into())));
    }

    #[test]
    fn test_float_keys_follow_their_hash() {
        assert!(!Value::Double(0.0).key_eq(&Value::Double(-0.0)));
        assert!(Value::Double(f64::NAN).key_eq(&Value::Double(f64::NAN)));
        assert!(Value::Double(1.5).key_eq(&Value::Double(1.5)));
    }

    #[test]
    fn test_as_i64() {
        assert_eq!(Value::Int(3).as_i64(), Some(3));
        assert_eq!(Value::BigInt(-9).as_i64(), Some(-9));
        assert_eq!(Value::Text("x".into()).as_i64(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Null.to_string(), "NULL");
        assert_eq!(Value::Text("a".into()).to_string(), "'a'");
        assert_eq!(Value::BigInt(12).to_string(), "12");
    }
}
