//! The universal success tuple (spec §7, §GLOSSARY).

use serde::{Deserialize, Serialize};
use std::fmt;

/// `(ok, message)` — the return type of every action in the system, from
/// a single chunk apply up to a whole CLI invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessTuple {
    pub ok: bool,
    pub message: String,
}

impl SuccessTuple {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ok
    }
}

impl From<crate::error::MrsmError> for SuccessTuple {
    fn from(err: crate::error::MrsmError) -> Self {
        SuccessTuple::fail(err.to_string())
    }
}

impl fmt::Display for SuccessTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MrsmError;

    #[test]
    fn ok_tuple_is_ok() {
        let t = SuccessTuple::ok("done");
        assert!(t.is_ok());
        assert_eq!(t.message, "done");
    }

    #[test]
    fn error_converts_to_failed_tuple() {
        let t: SuccessTuple = MrsmError::NotFound("pipe".into()).into();
        assert!(!t.is_ok());
        assert!(t.message.contains("not found"));
    }

    #[test]
    fn ndjson_roundtrip() {
        let t = SuccessTuple::ok("hi");
        let s = serde_json::to_string(&t).unwrap();
        let back: SuccessTuple = serde_json::from_str(&s).unwrap();
        assert_eq!(t, back);
    }
}
