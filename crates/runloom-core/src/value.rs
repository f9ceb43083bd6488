//! Typed payloads and the type registry
//!
//! Step payloads cross the engine as structural JSON tagged with a type
//! name. Tags are stable strings, so a payload persisted by one process
//! can be routed and decoded by another without any in-process type
//! identity. Assignability between tags is recorded explicitly in a
//! [`TypeRegistry`] consulted by routing and input preparation.

use std::collections::{HashMap, HashSet};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// A stable name identifying a payload type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(String);

impl TypeTag {
    /// Create a tag from a type name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The tag of a [`Payload`] type
    pub fn of<P: Payload>() -> Self {
        Self(P::TAG.to_string())
    }

    /// The tag name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TypeTag {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for TypeTag {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A value with a stable structural type
///
/// Serialized verbatim into instance state, suspension payloads and async
/// task records; decoded back into concrete types with [`TypedValue::decode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    /// Type tag used for routing and assignability checks
    pub tag: TypeTag,

    /// The payload itself
    pub value: serde_json::Value,
}

impl TypedValue {
    /// Create a typed value from a tag and raw JSON
    pub fn new(tag: impl Into<TypeTag>, value: serde_json::Value) -> Self {
        Self {
            tag: tag.into(),
            value,
        }
    }

    /// Encode a [`Payload`] into a typed value
    pub fn of<P: Payload>(payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            tag: TypeTag::of::<P>(),
            value: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload into a concrete type (structural conversion)
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.value.clone())
    }

    /// A null payload
    pub fn null() -> Self {
        Self {
            tag: TypeTag::new("null"),
            value: serde_json::Value::Null,
        }
    }

    /// Whether the payload is JSON null
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }
}

/// A payload type with a stable tag
///
/// This is the registration point replacing runtime reflection: user code
/// declares the tag once and the engine compares tags for assignability.
///
/// # Example
///
/// ```
/// use runloom_core::{Payload, TypedValue};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct NameInput {
///     name: String,
/// }
///
/// impl Payload for NameInput {
///     const TAG: &'static str = "name_input";
/// }
///
/// let value = TypedValue::of(&NameInput { name: "Ada".into() }).unwrap();
/// assert_eq!(value.tag.as_str(), "name_input");
/// ```
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    /// Unique type identifier for this payload
    const TAG: &'static str;
}

/// Declared input of a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputType {
    /// A concrete payload tag; matches itself and registered subtypes
    Value(TypeTag),

    /// Explicit marker accepting any prior output
    ///
    /// A plain `Value` tag never matches arbitrary outputs; a step that
    /// wants "whatever came last" must opt in with this marker.
    AnyValue,

    /// The step only reads the workflow context; no input argument
    Context,
}

impl InputType {
    /// Declared input for a [`Payload`] type
    pub fn of<P: Payload>() -> Self {
        Self::Value(TypeTag::of::<P>())
    }
}

/// Registry of assignability edges between type tags
///
/// A tag is always assignable to itself. Additional edges are registered
/// explicitly (`register_assignable("csv_rows", "rows")` makes a
/// `csv_rows` payload acceptable to a step declaring `rows`).
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    assignable: HashMap<TypeTag, HashSet<TypeTag>>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `from` payloads may be passed where `to` is declared
    pub fn register_assignable(&mut self, from: impl Into<TypeTag>, to: impl Into<TypeTag>) {
        self.assignable
            .entry(from.into())
            .or_default()
            .insert(to.into());
    }

    /// Whether a payload tagged `from` satisfies a declared `to`
    pub fn is_assignable(&self, from: &TypeTag, to: &TypeTag) -> bool {
        if from == to {
            return true;
        }
        self.assignable
            .get(from)
            .is_some_and(|targets| targets.contains(to))
    }

    /// Whether a declared step input accepts a payload with the given tag
    pub fn accepts(&self, input: &InputType, tag: &TypeTag) -> bool {
        match input {
            InputType::Value(declared) => self.is_assignable(tag, declared),
            InputType::AnyValue => true,
            InputType::Context => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Greeting {
        text: String,
    }

    impl Payload for Greeting {
        const TAG: &'static str = "greeting";
    }

    #[test]
    fn test_typed_value_round_trip() {
        let value = TypedValue::of(&Greeting {
            text: "hello".into(),
        })
        .expect("should encode");

        assert_eq!(value.tag, TypeTag::new("greeting"));

        let decoded: Greeting = value.decode().expect("should decode");
        assert_eq!(decoded.text, "hello");
    }

    #[test]
    fn test_tag_assignable_to_itself() {
        let registry = TypeRegistry::new();
        let tag = TypeTag::new("greeting");
        assert!(registry.is_assignable(&tag, &tag));
    }

    #[test]
    fn test_registered_edge() {
        let mut registry = TypeRegistry::new();
        registry.register_assignable("csv_rows", "rows");

        assert!(registry.is_assignable(&"csv_rows".into(), &"rows".into()));
        assert!(!registry.is_assignable(&"rows".into(), &"csv_rows".into()));
    }

    #[test]
    fn test_any_value_accepts_everything() {
        let registry = TypeRegistry::new();
        assert!(registry.accepts(&InputType::AnyValue, &"anything".into()));
    }

    #[test]
    fn test_plain_tag_does_not_accept_arbitrary_outputs() {
        let registry = TypeRegistry::new();
        let declared = InputType::Value("rows".into());
        assert!(!registry.accepts(&declared, &"greeting".into()));
    }

    #[test]
    fn test_context_input_accepts_no_payload() {
        let registry = TypeRegistry::new();
        assert!(!registry.accepts(&InputType::Context, &"greeting".into()));
    }

    #[test]
    fn test_typed_value_serialization() {
        let value = TypedValue::new("greeting", serde_json::json!({ "text": "hi" }));
        let json = serde_json::to_string(&value).unwrap();
        let parsed: TypedValue = serde_json::from_str(&json).unwrap();
        assert_eq!(value, parsed);
    }
}
