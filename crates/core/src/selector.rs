use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Set-based comparison operators, spelled the way label selectors spell them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "exists")]
    Exists,
    #[serde(rename = "!")]
    DoesNotExist,
    #[serde(rename = "=")]
    Equals,
    #[serde(rename = "==")]
    DoubleEquals,
    #[serde(rename = "!=")]
    NotEquals,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "notin")]
    NotIn,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Exists => "exists",
            Operator::DoesNotExist => "!",
            Operator::Equals => "=",
            Operator::DoubleEquals => "==",
            Operator::NotEquals => "!=",
            Operator::In => "in",
            Operator::NotIn => "notin",
        }
    }

    /// Evaluate against an optional string value (annotation or label).
    pub fn matches_str(self, actual: Option<&str>, values: &[String]) -> bool {
        match (self, actual) {
            (Operator::Exists, a) => a.is_some(),
            (Operator::DoesNotExist, a) => a.is_none(),
            (_, None) => matches!(self, Operator::NotEquals | Operator::NotIn),
            (Operator::Equals | Operator::DoubleEquals | Operator::In, Some(a)) => values.iter().any(|v| v == a),
            (Operator::NotEquals | Operator::NotIn, Some(a)) => values.iter().all(|v| v != a),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Operator {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exists" => Ok(Operator::Exists),
            "!" => Ok(Operator::DoesNotExist),
            "=" => Ok(Operator::Equals),
            "==" => Ok(Operator::DoubleEquals),
            "!=" => Ok(Operator::NotEquals),
            "in" => Ok(Operator::In),
            "notin" => Ok(Operator::NotIn),
            other => Err(format!("unknown operator {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_matching() {
        let vals = vec!["a".to_string(), "b".to_string()];
        assert!(Operator::In.matches_str(Some("b"), &vals));
        assert!(!Operator::NotIn.matches_str(Some("b"), &vals));
        assert!(Operator::NotIn.matches_str(None, &vals));
        assert!(!Operator::Equals.matches_str(None, &vals));
        assert!(Operator::Exists.matches_str(Some(""), &[]));
        assert!(Operator::DoesNotExist.matches_str(None, &[]));
    }

    #[test]
    fn wire_names_roundtrip() {
        for op in [Operator::Exists, Operator::DoesNotExist, Operator::Equals, Operator::DoubleEquals, Operator::NotEquals, Operator::In, Operator::NotIn] {
            let s = serde_json::to_string(&op).unwrap();
            assert_eq!(s.trim_matches('"'), op.as_str());
            assert_eq!(op.as_str().parse::<Operator>().unwrap(), op);
        }
    }
}
