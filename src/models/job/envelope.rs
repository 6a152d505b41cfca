//! Defines the wire format of jobs stored on queue lists.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{RusqueError, RusqueResult};

/// A job as stored on a queue list: a JSON object with `class`, `args` and
/// `id` keys, in that order.
///
/// `args` always wraps the caller's argument mapping in a one-element array,
/// matching what other Resque producers put on the wire.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Envelope {
    /// Opaque handler name, resolved through the handler registry.
    pub class: String,

    /// One-element array wrapping the caller's argument mapping.
    pub args: Vec<Value>,

    /// Hex identity string, unique per envelope instance.
    pub id: String,
}

impl Envelope {
    /// Build an envelope wrapping given caller arguments.
    pub fn new<S: Into<String>>(class: S, args: Option<Value>, id: String) -> Self {
        Self {
            class: class.into(),
            args: vec![args.unwrap_or(Value::Null)],
            id,
        }
    }

    /// The caller's argument mapping, i.e. `args[0]`.
    pub fn arguments(&self) -> &Value {
        self.args.first().unwrap_or(&Value::Null)
    }

    /// Serialise this envelope for storage on a queue list.
    pub fn encode(&self) -> RusqueResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode an envelope popped from a queue list.
    pub fn decode(raw: &str) -> RusqueResult<Self> {
        serde_json::from_str(raw)
            .map_err(|err| RusqueError::Parse(format!("invalid job envelope: {}", err)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_layout_key_order() {
        let envelope = Envelope::new("Example", Some(json!({"k": 1})), "abc123".to_string());
        assert_eq!(
            envelope.encode().unwrap(),
            r#"{"class":"Example","args":[{"k":1}],"id":"abc123"}"#
        );
    }

    #[test]
    fn absent_args_encode_as_null() {
        let envelope = Envelope::new("Example", None, "abc123".to_string());
        assert_eq!(envelope.arguments(), &Value::Null);
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn arguments_round_trip() {
        let args = json!({"user": 42, "name": "x"});
        let envelope = Envelope::new("Example", Some(args.clone()), "id1".to_string());
        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.arguments(), &args);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"class":"X"}"#).is_err());
    }
}
