// Typed events and their payload codec.
//
// An `Event` is a `kind` tag plus an open set of named attributes chosen by
// the application. Attribute values are `Value`s, a closed tagged union of
// inert data (numbers, strings, booleans, bytes, lists, nested maps). The
// relay annotates received events with the `ConnectionId` they arrived on;
// that annotation is local and never travels on the wire.
//
// Payload format: a JSON object
//
//     {"version": 1, "kind": "ping", "attributes": {"n": {"Int": 1}}}
//
// Values are externally tagged, so an integer never comes back as a float and
// bytes never come back as a list. Decoding can only ever produce `Value`s;
// no type named by the payload is resolved or constructed. The version field
// is checked before the rest of the payload is interpreted.
//
// Two limits keep encode and decode symmetric: JSON has no representation
// for NaN or infinities, and serde_json refuses to parse nesting deeper than
// its recursion limit. Both are enforced at encode time (`NonFiniteFloat`,
// `TooDeep`) so an event that encodes successfully always decodes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionId;

/// Current payload format version.
pub const EVENT_FORMAT_VERSION: u32 = 1;

/// Deepest attribute nesting accepted by `Event::to_bytes`. A top-level
/// attribute counts as depth 1.
pub const MAX_VALUE_DEPTH: usize = 32;

/// An attribute value.
///
/// `From` conversions cover the common cases: `event.with("n", 1)`,
/// `event.with("location", [1.0, 2.0, 3.0])`. Note that `Vec<u8>` converts to
/// a `List` of integers; use `Value::Bytes` for a byte string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Numeric value as `f64`; integers are widened.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

macro_rules! value_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Value::Int(i64::from(n))
                }
            }
        )*
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<f32> for Value {
    fn from(x: f32) -> Self {
        Value::Float(f64::from(x))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(items: [T; N]) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Errors from `Event::to_bytes`.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("attribute {attribute:?} holds a non-finite float")]
    NonFiniteFloat { attribute: String },

    #[error("attribute {attribute:?} nests deeper than {MAX_VALUE_DEPTH} levels")]
    TooDeep { attribute: String },

    #[error("event serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from `Event::from_bytes`.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed event payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported event format version {0} (expected {EVENT_FORMAT_VERSION})")]
    UnsupportedVersion(u32),
}

/// A typed, attribute-bearing message.
#[derive(Clone, Debug)]
pub struct Event {
    kind: String,
    attributes: BTreeMap<String, Value>,
    origin: Option<ConnectionId>,
}

/// Events compare by value: `kind` and attributes. The origin annotation is
/// ignored.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.attributes == other.attributes
    }
}

#[derive(Serialize)]
struct WireEventRef<'a> {
    version: u32,
    kind: &'a str,
    attributes: &'a BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct WireVersion {
    version: u32,
}

#[derive(Deserialize)]
struct WireEvent {
    kind: String,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
}

impl Event {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: BTreeMap::new(),
            origin: None,
        }
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Set an attribute, returning the previous value if there was one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes.insert(name.into(), value.into())
    }

    /// Look up an attribute. Missing attributes are `None`, not an error.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// The connection this event arrived on, if it was received by a relay.
    pub fn origin(&self) -> Option<ConnectionId> {
        self.origin
    }

    pub fn set_origin(&mut self, origin: ConnectionId) {
        self.origin = Some(origin);
    }

    /// Serialize `kind` and attributes into a payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        for (name, value) in &self.attributes {
            check_value(name, value, 1)?;
        }
        let wire = WireEventRef {
            version: EVENT_FORMAT_VERSION,
            kind: &self.kind,
            attributes: &self.attributes,
        };
        Ok(serde_json::to_vec(&wire)?)
    }

    /// Reconstruct an event from a payload produced by `to_bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let WireVersion { version } = serde_json::from_slice(bytes)?;
        if version != EVENT_FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let wire: WireEvent = serde_json::from_slice(bytes)?;
        Ok(Self {
            kind: wire.kind,
            attributes: wire.attributes,
            origin: None,
        })
    }
}

fn check_value(attribute: &str, value: &Value, depth: usize) -> Result<(), EncodeError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(EncodeError::TooDeep {
            attribute: attribute.to_owned(),
        });
    }
    match value {
        Value::Float(x) if !x.is_finite() => Err(EncodeError::NonFiniteFloat {
            attribute: attribute.to_owned(),
        }),
        Value::List(items) => items
            .iter()
            .try_for_each(|item| check_value(attribute, item, depth + 1)),
        Value::Map(map) => map
            .values()
            .try_for_each(|item| check_value(attribute, item, depth + 1)),
        _ => Ok(()),
    }
}

/// `Event<kind>`; the alternate form (`{:#}`) also lists every attribute.
impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event<{}>", self.kind)?;
        if f.alternate() {
            if self.attributes.is_empty() {
                write!(f, "\n  (no attributes)")?;
            }
            let width = self.attributes.keys().map(String::len).max().unwrap_or(0);
            for (name, value) in &self.attributes {
                write!(f, "\n  {name:<width$} : {value:?}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn translate_event() -> Event {
        Event::new("OBJ_TRANSLATE_CLIENT")
            .with("obj_name", "Cube_Local_A")
            .with("location", [1.5, -2.0, 0.25])
            .with("frame", 42)
            .with("selected", true)
    }

    #[test]
    fn roundtrip_keeps_kind_and_attributes() {
        let event = translate_event();
        let decoded = Event::from_bytes(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.kind(), "OBJ_TRANSLATE_CLIENT");
        assert_eq!(decoded.get("frame"), Some(&Value::Int(42)));
        assert_eq!(
            decoded.get("location").and_then(Value::as_list),
            Some(&[Value::Float(1.5), Value::Float(-2.0), Value::Float(0.25)][..])
        );
    }

    #[test]
    fn roundtrip_event_without_attributes() {
        let event = Event::new("heartbeat");
        let decoded = Event::from_bytes(&event.to_bytes().unwrap()).unwrap();
        assert!(decoded.is_kind("heartbeat"));
        assert!(decoded.attributes().is_empty());
    }

    #[test]
    fn roundtrip_nested_map_and_bytes() {
        let mut inner = BTreeMap::new();
        inner.insert("blob".to_owned(), Value::Bytes(vec![0, 255, 7]));
        inner.insert("nothing".to_owned(), Value::Null);
        let event = Event::new("nested").with("inner", inner);
        let decoded = Event::from_bytes(&event.to_bytes().unwrap()).unwrap();
        let map = decoded.get("inner").and_then(Value::as_map).unwrap();
        assert_eq!(map["blob"].as_bytes(), Some(&[0u8, 255, 7][..]));
        assert!(map["nothing"].is_null());
    }

    #[test]
    fn integers_and_floats_stay_distinct() {
        let event = Event::new("numbers").with("i", 3).with("f", 3.0);
        let decoded = Event::from_bytes(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.get("i"), Some(&Value::Int(3)));
        assert_eq!(decoded.get("f"), Some(&Value::Float(3.0)));
        assert_eq!(decoded.get("i").and_then(Value::as_f64), Some(3.0));
    }

    #[test]
    fn missing_attribute_is_none() {
        assert_eq!(translate_event().get("velocity"), None);
    }

    #[test]
    fn set_and_remove_attributes() {
        let mut event = Event::new("edit");
        assert_eq!(event.set("count", 1), None);
        assert_eq!(event.set("count", 2), Some(Value::Int(1)));
        assert_eq!(event.remove("count"), Some(Value::Int(2)));
        assert!(event.attributes().is_empty());
    }

    #[test]
    fn origin_is_not_serialized_or_compared() {
        let mut event = Event::new("ping").with("n", 1);
        event.set_origin(ConnectionId(9));
        assert_eq!(event.origin(), Some(ConnectionId(9)));

        let decoded = Event::from_bytes(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.origin(), None);
        assert_eq!(decoded, event);
    }

    #[test]
    fn option_converts_to_null() {
        let event = Event::new("opt")
            .with("some", Some(5))
            .with("none", None::<i32>);
        assert_eq!(event.get("some"), Some(&Value::Int(5)));
        assert_eq!(event.get("none"), Some(&Value::Null));
    }

    #[test]
    fn non_finite_float_is_rejected_at_encode() {
        let event = Event::new("bad").with("nested", vec![Value::Float(f64::NAN)]);
        let err = event.to_bytes().unwrap_err();
        assert!(
            matches!(&err, EncodeError::NonFiniteFloat { attribute } if attribute == "nested"),
            "got {err:?}"
        );
    }

    #[test]
    fn over_deep_value_is_rejected_at_encode() {
        let mut value = Value::Int(0);
        for _ in 0..MAX_VALUE_DEPTH {
            value = Value::List(vec![value]);
        }
        let err = Event::new("deep").with("v", value).to_bytes().unwrap_err();
        assert!(matches!(err, EncodeError::TooDeep { .. }), "got {err:?}");
    }

    #[test]
    fn deepest_allowed_value_roundtrips() {
        let mut value = Value::Int(0);
        for _ in 1..MAX_VALUE_DEPTH {
            value = Value::List(vec![value]);
        }
        let event = Event::new("deep").with("v", value);
        let decoded = Event::from_bytes(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn rejects_unknown_version() {
        let bytes = br#"{"version": 2, "kind": "ping", "attributes": {}}"#;
        assert!(matches!(
            Event::from_bytes(bytes),
            Err(DecodeError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn rejects_missing_kind() {
        let bytes = br#"{"version": 1, "attributes": {}}"#;
        assert!(matches!(Event::from_bytes(bytes), Err(DecodeError::Json(_))));
    }

    #[test]
    fn rejects_non_string_kind() {
        let bytes = br#"{"version": 1, "kind": 7}"#;
        assert!(matches!(Event::from_bytes(bytes), Err(DecodeError::Json(_))));
    }

    #[test]
    fn rejects_truncated_payload() {
        let bytes = translate_event().to_bytes().unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(Event::from_bytes(truncated).is_err());
    }

    #[test]
    fn rejects_arbitrary_binary() {
        assert!(Event::from_bytes(&[0x80, 0x04, 0x95, 0x00, 0xff]).is_err());
        assert!(Event::from_bytes(b"").is_err());
    }

    #[test]
    fn hostile_nesting_fails_cleanly() {
        let mut payload = br#"{"version": 1, "kind": "x", "attributes": {"a": "#.to_vec();
        payload.extend(std::iter::repeat_n(b'[', 100_000));
        assert!(matches!(
            Event::from_bytes(&payload),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn display_forms() {
        let event = Event::new("ping").with("n", 1);
        assert_eq!(event.to_string(), "Event<ping>");
        assert_eq!(format!("{event:#}"), "Event<ping>\n  n : Int(1)");
        assert_eq!(
            format!("{:#}", Event::new("empty")),
            "Event<empty>\n  (no attributes)"
        );
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<f64>()
                .prop_filter("JSON carries finite floats only", |x| x.is_finite())
                .prop_map(Value::Float),
            ".{0,16}".prop_map(Value::Str),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(4, 32, 6, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
                proptest::collection::btree_map(".{0,8}", inner, 0..6).prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn any_event_roundtrips(
            kind in ".{0,24}",
            attributes in proptest::collection::btree_map(".{0,12}", arb_value(), 0..8),
        ) {
            let mut event = Event::new(kind);
            for (name, value) in attributes {
                event.set(name, value);
            }
            let decoded = Event::from_bytes(&event.to_bytes().unwrap()).unwrap();
            prop_assert_eq!(decoded.kind(), event.kind());
            prop_assert_eq!(decoded.attributes(), event.attributes());
        }
    }
}
