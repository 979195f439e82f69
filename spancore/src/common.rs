use std::borrow::{Borrow, Cow};
use std::fmt;

/// The key part of annotation [`KeyValue`] pairs.
#[cfg_attr(feature = "serialize", derive(serde::Deserialize, serde::Serialize))]
#[non_exhaustive]
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Cow<'static, str>);

impl Key {
    /// Create a new `Key`.
    ///
    /// # Examples
    ///
    /// ```
    /// use spancore::Key;
    ///
    /// let key1 = Key::new("my_static_str");
    /// let key2 = Key::new(String::from("my_owned_string"));
    /// ```
    pub fn new(value: impl Into<Key>) -> Self {
        value.into()
    }

    /// Create a new const `Key`.
    pub const fn from_static_str(value: &'static str) -> Self {
        Key(Cow::Borrowed(value))
    }

    /// Returns a reference to the underlying key name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&'static str> for Key {
    fn from(key_str: &'static str) -> Self {
        Key(Cow::Borrowed(key_str))
    }
}

impl From<String> for Key {
    fn from(string: String) -> Self {
        Key(Cow::Owned(string))
    }
}

impl From<Cow<'static, str>> for Key {
    fn from(string: Cow<'static, str>) -> Self {
        Key(string)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0.into_owned()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(fmt)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.0)
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The value part of annotation [`KeyValue`] pairs.
#[cfg_attr(feature = "serialize", derive(serde::Deserialize, serde::Serialize))]
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// bool values
    Bool(bool),
    /// i64 values
    I64(i64),
    /// f64 values
    F64(f64),
    /// String values
    String(Cow<'static, str>),
}

macro_rules! from_values {
    ($(($t:ty, $val:expr);)+) => {
        $(
            impl From<$t> for Value {
                fn from(t: $t) -> Self {
                    $val(t)
                }
            }
        )+
    }
}

from_values!(
    (bool, Value::Bool);
    (i64, Value::I64);
    (f64, Value::F64);
    (Cow<'static, str>, Value::String);
);

impl From<i32> for Value {
    fn from(val: i32) -> Self {
        Value::I64(val.into())
    }
}

impl From<u32> for Value {
    fn from(val: u32) -> Self {
        Value::I64(val.into())
    }
}

impl From<&'static str> for Value {
    fn from(s: &'static str) -> Self {
        Value::String(Cow::Borrowed(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Cow::Owned(s))
    }
}

impl Value {
    /// String representation of the `Value`.
    ///
    /// This will allocate iff the underlying value is not a `String`.
    pub fn as_str(&self) -> Cow<'_, str> {
        match self {
            Value::Bool(v) => format!("{v}").into(),
            Value::I64(v) => format!("{v}").into(),
            Value::F64(v) => format!("{v}").into(),
            Value::String(v) => Cow::Borrowed(v.as_ref()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => v.fmt(fmt),
            Value::I64(v) => v.fmt(fmt),
            Value::F64(v) => v.fmt(fmt),
            Value::String(v) => fmt.write_str(v),
        }
    }
}

/// A key-value annotation pair, attached to [`Event`]s.
///
/// [`Event`]: crate::trace::Event
#[cfg_attr(feature = "serialize", derive(serde::Deserialize, serde::Serialize))]
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub struct KeyValue {
    /// The attribute name
    pub key: Key,
    /// The attribute value
    pub value: Value,
}

impl KeyValue {
    /// Create a new `KeyValue` pair.
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<Key>,
        V: Into<Value>,
    {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_float_value_displayed_full_precision() {
        let kv = KeyValue::new("weight", 8.777);
        assert_eq!(kv.value.as_str(), "8.777");
    }

    #[test]
    fn key_borrows_as_str() {
        let key = Key::new("db.statement".to_string());
        assert_eq!(key.as_str(), "db.statement");
        assert_eq!(String::from(key), "db.statement");
    }

    #[test]
    fn value_conversions() {
        assert_eq!(Value::from(true).as_str(), "true");
        assert_eq!(Value::from(42_i64), Value::I64(42));
        assert_eq!(Value::from("static").as_str(), "static");
        assert_eq!(Value::from(String::from("owned")).as_str(), "owned");
    }
}
