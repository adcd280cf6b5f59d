use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::Value;

/// String comparison rules for user data.
///
/// Only the strength level is honoured: strengths 1 and 2 compare strings
/// case-insensitively, 3 and above compare them binary. The `simple` locale
/// always compares binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
    #[serde(default = "default_strength")]
    pub strength: u8,
}

fn default_strength() -> u8 {
    3
}

impl Default for Collation {
    fn default() -> Self {
        Self::simple()
    }
}

impl Collation {
    pub fn simple() -> Self {
        Self {
            locale: "simple".to_string(),
            strength: default_strength(),
        }
    }

    pub fn is_simple(&self) -> bool {
        self.locale == "simple" || self.strength >= 3
    }

    /// Parse `{locale: "...", strength: n}`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Document(doc) = value else {
            return Err(Error::InvalidOptions("collation must be an object".into()));
        };
        let locale = match doc.get("locale") {
            Some(Value::String(s)) => s.clone(),
            _ => {
                return Err(Error::InvalidOptions(
                    "collation requires a 'locale' string".into(),
                ));
            }
        };
        let strength = match doc.get("strength") {
            None => default_strength(),
            Some(v) => match v.integral_i64() {
                Some(n @ 1..=5) => n as u8,
                _ => {
                    return Err(Error::InvalidOptions(
                        "collation strength must be an integer from 1 to 5".into(),
                    ));
                }
            },
        };
        for key in doc.keys() {
            if key != "locale" && key != "strength" {
                return Err(Error::InvalidOptions(format!(
                    "unsupported collation option '{key}'"
                )));
            }
        }
        Ok(Self { locale, strength })
    }

    pub fn compare_str(&self, a: &str, b: &str) -> Ordering {
        if self.is_simple() {
            return a.cmp(b);
        }
        let la = a.chars().flat_map(char::to_lowercase);
        let lb = b.chars().flat_map(char::to_lowercase);
        la.cmp(lb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn simple_is_binary() {
        let c = Collation::simple();
        assert_eq!(c.compare_str("a", "B"), Ordering::Greater);
    }

    #[test]
    fn strength_two_ignores_case() {
        let c = Collation::from_value(&Value::from_json(&json!({"locale": "en", "strength": 2})))
            .unwrap();
        assert_eq!(c.compare_str("Hello", "hELLO"), Ordering::Equal);
        assert_eq!(c.compare_str("apple", "Banana"), Ordering::Less);
    }

    #[test]
    fn rejects_bad_strength() {
        let err =
            Collation::from_value(&Value::from_json(&json!({"locale": "en", "strength": 9})))
                .unwrap_err();
        assert_eq!(err.code(), 2);
    }
}
