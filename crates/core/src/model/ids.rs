use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error type for parsing an ID from a string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    kind: &'static str,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {} from string", self.kind)
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            #[must_use]
            pub const fn new(id: u64) -> Self {
                Self(id)
            }

            /// Returns the underlying u64 value
            #[must_use]
            pub fn value(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim()
                    .parse::<u64>()
                    .map($name::new)
                    .map_err(|_| ParseIdError {
                        kind: stringify!($name),
                    })
            }
        }
    };
}

numeric_id!(
    /// Identifier of an authenticated user, supplied by the caller.
    UserId
);
numeric_id!(
    /// Identifier of an exam definition in the catalog.
    ExamId
);
numeric_id!(
    /// Identifier of a question in the question bank.
    QuestionId
);
numeric_id!(
    /// Identifier of a single exam attempt.
    AttemptId
);
numeric_id!(
    /// Identifier of a wrong-question ledger entry.
    WrongQuestionId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_id_display() {
        let id = AttemptId::new(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(format!("{id:?}"), "AttemptId(42)");
    }

    #[test]
    fn exam_id_from_str_trims() {
        let id: ExamId = " 123 ".parse().unwrap();
        assert_eq!(id, ExamId::new(123));
    }

    #[test]
    fn question_id_from_str_invalid() {
        let err = "q-7".parse::<QuestionId>().unwrap_err();
        assert_eq!(err.to_string(), "failed to parse QuestionId from string");
    }

    #[test]
    fn ids_order_numerically() {
        assert!(UserId::new(2) < UserId::new(10));
    }
}
