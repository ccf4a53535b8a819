use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Identity of a durable promise.
///
/// This is the only value that crosses process boundaries verbatim: push
/// payloads, shared-container files and IPC messages carry it as the
/// hyphenated UUID string produced by [`fmt::Display`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct PromiseId(Uuid);

impl PromiseId {
    /// Generate a fresh random (v4) id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for PromiseId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::PromiseId;

    #[test]
    fn display_parses_back_to_same_id() {
        let id = PromiseId::generate();
        let parsed: PromiseId = id.to_string().parse().expect("parse id");
        assert_eq!(parsed, id);
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(PromiseId::generate(), PromiseId::generate());
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-a-uuid".parse::<PromiseId>().is_err());
    }
}
