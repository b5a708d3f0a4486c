//! Validated names for queues and job types.

use core::borrow::Borrow;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

const MAX_NAME_LEN: usize = 128;

fn validate(kind: &str, value: &str) -> Result<(), DomainError> {
    if value.is_empty() {
        return Err(DomainError::validation(format!("{kind} must not be empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(DomainError::validation(format!(
            "{kind} must be at most {MAX_NAME_LEN} bytes, got {}",
            value.len()
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(DomainError::validation(format!(
            "{kind} must not contain whitespace or control characters: {value:?}"
        )));
    }
    Ok(())
}

macro_rules! impl_name_newtype {
    ($t:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $t(String);

        impl $t {
            pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
                let value = value.into();
                validate($kind, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $t {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $t {
            type Error = DomainError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $t {
            type Error = DomainError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }
    };
}

impl_name_newtype!(QueueName, "queue name");
impl_name_newtype!(JobType, "job type");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_names() {
        assert_eq!(QueueName::new("default").unwrap().as_str(), "default");
        assert_eq!(JobType::new("send-email").unwrap().to_string(), "send-email");
        assert!(JobType::new("roi.recompute:v2").is_ok());
    }

    #[test]
    fn rejects_empty_and_blank_names() {
        assert!(matches!(QueueName::new(""), Err(DomainError::Validation(_))));
        assert!(matches!(JobType::new("send email"), Err(DomainError::Validation(_))));
        assert!(matches!(JobType::new("tab\there"), Err(DomainError::Validation(_))));
    }

    #[test]
    fn rejects_overlong_names() {
        let long = "q".repeat(MAX_NAME_LEN + 1);
        assert!(QueueName::new(long).is_err());
        assert!(QueueName::new("q".repeat(MAX_NAME_LEN)).is_ok());
    }

    #[test]
    fn deserialization_validates() {
        let ok: JobType = serde_json::from_str("\"compliance-check\"").unwrap();
        assert_eq!(ok.as_str(), "compliance-check");
        assert!(serde_json::from_str::<JobType>("\"\"").is_err());
    }
}
