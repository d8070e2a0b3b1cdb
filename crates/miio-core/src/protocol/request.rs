//! JSON request bodies.
//!
//! A request body is the JSON object `{"id":N,"method":"...","params":...}`.
//! `params` is left out entirely when it carries nothing: `null`, the empty
//! string, or a one-element array holding only the empty string.
//!
//! # Nested-array compatibility shim
//!
//! Existing integrations pass nested arrays as a *string* inside an array,
//! e.g. `["[1,2]"]`, and devices expect to receive `[[1,2]]`.  With
//! [`PayloadCompat::NestedArrayShim`] the first `["[` in the serialized text
//! becomes `[[` and the first `]"]` becomes `]]`.  Callers that pass real
//! nested arrays get identical bytes either way.

use serde::Serialize;
use serde_json::Value;

use crate::protocol::codec::ProtocolError;

/// How the serialized request text is post-processed before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadCompat {
    /// Plain `serde_json` output.
    Strict,
    /// Unquote a stringified nested array (see module docs).
    #[default]
    NestedArrayShim,
}

/// A method call addressed to a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u32,
    pub method: String,
    pub params: Value,
}

#[derive(Serialize)]
struct Body<'a> {
    id: u32,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

impl Request {
    pub fn new(id: u32, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// The params that will be sent, or `None` when they are omitted.
    pub fn effective_params(&self) -> Option<&Value> {
        if params_are_empty(&self.params) {
            None
        } else {
            Some(&self.params)
        }
    }

    /// Serializes the request body.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MalformedPayload`] if the method name is empty
    /// or serialization fails.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use miio_core::{PayloadCompat, Request};
    /// use serde_json::json;
    ///
    /// let req = Request::new(1, "get_prop", json!(["power"]));
    /// assert_eq!(
    ///     req.to_json(PayloadCompat::Strict).unwrap(),
    ///     r#"{"id":1,"method":"get_prop","params":["power"]}"#
    /// );
    /// ```
    pub fn to_json(&self, compat: PayloadCompat) -> Result<String, ProtocolError> {
        if self.method.is_empty() {
            return Err(ProtocolError::MalformedPayload(
                "cannot build a request without a method".into(),
            ));
        }

        let body = Body {
            id: self.id,
            method: &self.method,
            params: self.effective_params(),
        };
        let text = serde_json::to_string(&body)
            .map_err(|e| ProtocolError::MalformedPayload(e.to_string()))?;

        Ok(match compat {
            PayloadCompat::Strict => text,
            PayloadCompat::NestedArrayShim => apply_nested_array_shim(&text),
        })
    }
}

fn params_are_empty(params: &Value) -> bool {
    match params {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => matches!(items.as_slice(), [Value::String(s)] if s.is_empty()),
        _ => false,
    }
}

fn apply_nested_array_shim(text: &str) -> String {
    text.replacen("[\"[", "[[", 1).replacen("]\"]", "]]", 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_to_json_orders_id_method_params() {
        // Arrange
        let req = Request::new(1, "get_prop", json!(["power"]));

        // Act
        let text = req.to_json(PayloadCompat::NestedArrayShim).unwrap();

        // Assert
        assert_eq!(text, r#"{"id":1,"method":"get_prop","params":["power"]}"#);
    }

    #[test]
    fn test_params_omitted_when_null_empty_string_or_single_empty_string() {
        for params in [json!(null), json!(""), json!([""])] {
            // Act
            let text = Request::new(3, "miIO.info", params.clone())
                .to_json(PayloadCompat::Strict)
                .unwrap();

            // Assert
            assert_eq!(
                text, r#"{"id":3,"method":"miIO.info"}"#,
                "params {params} must be omitted"
            );
        }
    }

    #[test]
    fn test_empty_array_params_are_kept() {
        let text = Request::new(4, "get_status", json!([]))
            .to_json(PayloadCompat::Strict)
            .unwrap();
        assert_eq!(text, r#"{"id":4,"method":"get_status","params":[]}"#);
    }

    #[test]
    fn test_two_empty_strings_are_kept() {
        let text = Request::new(5, "m", json!(["", ""]))
            .to_json(PayloadCompat::Strict)
            .unwrap();
        assert_eq!(text, r#"{"id":5,"method":"m","params":["",""]}"#);
    }

    #[test]
    fn test_shim_unquotes_stringified_nested_array() {
        // Arrange
        let req = Request::new(9, "set_timer", json!(["[1,2]"]));

        // Act
        let shimmed = req.to_json(PayloadCompat::NestedArrayShim).unwrap();
        let strict = req.to_json(PayloadCompat::Strict).unwrap();

        // Assert
        assert_eq!(shimmed, r#"{"id":9,"method":"set_timer","params":[[1,2]]}"#);
        assert_eq!(strict, r#"{"id":9,"method":"set_timer","params":["[1,2]"]}"#);
    }

    #[test]
    fn test_shim_leaves_real_nested_arrays_unchanged() {
        let req = Request::new(2, "set_timer", json!([[1, 2]]));
        assert_eq!(
            req.to_json(PayloadCompat::NestedArrayShim).unwrap(),
            req.to_json(PayloadCompat::Strict).unwrap()
        );
    }

    #[test]
    fn test_object_params_are_serialized() {
        let text = Request::new(6, "set_properties", json!({"did": "power", "value": true}))
            .to_json(PayloadCompat::Strict)
            .unwrap();
        assert_eq!(
            text,
            r#"{"id":6,"method":"set_properties","params":{"did":"power","value":true}}"#
        );
    }

    #[test]
    fn test_empty_method_is_rejected() {
        let result = Request::new(1, "", json!(null)).to_json(PayloadCompat::Strict);
        assert!(matches!(result, Err(ProtocolError::MalformedPayload(_))));
    }
}
