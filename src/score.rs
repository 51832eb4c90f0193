use std::fmt;
use std::str::FromStr;

use crate::error::HamcError;

/// A placement or constraint score as the cluster manager understands it.
///
/// `ALWAYS` and `NEVER` are accepted as aliases of `INFINITY` and
/// `-INFINITY`, so comparisons are semantic rather than textual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Score {
    Value(i64),
    Infinity,
    MinusInfinity,
}

impl FromStr for Score {
    type Err = HamcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_uppercase().as_str() {
            "INFINITY" | "+INFINITY" | "ALWAYS" => Ok(Score::Infinity),
            "-INFINITY" | "NEVER" => Ok(Score::MinusInfinity),
            _ => s
                .parse::<i64>()
                .map(Score::Value)
                .map_err(|_| HamcError::InvalidScore {
                    value: s.to_string(),
                }),
        }
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Value(v) => write!(f, "{v}"),
            Score::Infinity => f.write_str("INFINITY"),
            Score::MinusInfinity => f.write_str("-INFINITY"),
        }
    }
}

/// Parse a score field where an empty string means "no score".
pub fn parse_optional(s: &str) -> Result<Option<Score>, HamcError> {
    if s.trim().is_empty() {
        Ok(None)
    } else {
        s.parse().map(Some)
    }
}

/// Location rule operation. `eq` pins towards the host, `ne` away from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LocationOp {
    #[default]
    Eq,
    Ne,
}

impl FromStr for LocationOp {
    type Err = HamcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "eq" => Ok(LocationOp::Eq),
            "ne" => Ok(LocationOp::Ne),
            other => Err(HamcError::Validation {
                message: format!("unknown location operation '{other}' (use eq or ne)"),
            }),
        }
    }
}

impl fmt::Display for LocationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocationOp::Eq => f.write_str("eq"),
            LocationOp::Ne => f.write_str("ne"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sentinels() {
        assert_eq!("INFINITY".parse::<Score>().unwrap(), Score::Infinity);
        assert_eq!("+INFINITY".parse::<Score>().unwrap(), Score::Infinity);
        assert_eq!("always".parse::<Score>().unwrap(), Score::Infinity);
        assert_eq!("-INFINITY".parse::<Score>().unwrap(), Score::MinusInfinity);
        assert_eq!("NEVER".parse::<Score>().unwrap(), Score::MinusInfinity);
    }

    #[test]
    fn parse_numbers() {
        assert_eq!("100".parse::<Score>().unwrap(), Score::Value(100));
        assert_eq!(" -50 ".parse::<Score>().unwrap(), Score::Value(-50));
    }

    #[test]
    fn rejects_garbage() {
        assert!("sometimes".parse::<Score>().is_err());
    }

    #[test]
    fn empty_is_no_score() {
        assert_eq!(parse_optional("").unwrap(), None);
        assert_eq!(parse_optional("  ").unwrap(), None);
        assert_eq!(parse_optional("ALWAYS").unwrap(), Some(Score::Infinity));
    }

    #[test]
    fn display_normalizes_aliases() {
        let s: Score = "always".parse().unwrap();
        assert_eq!(s.to_string(), "INFINITY");
    }

    #[test]
    fn location_op_defaults_to_eq() {
        assert_eq!("".parse::<LocationOp>().unwrap(), LocationOp::Eq);
        assert_eq!("ne".parse::<LocationOp>().unwrap(), LocationOp::Ne);
        assert!("gt".parse::<LocationOp>().is_err());
    }
}
