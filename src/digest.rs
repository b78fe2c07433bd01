//! Content-addressed change detection for registry entries.
//!
//! MD5 is a change-detection fingerprint here, not a security boundary — it
//! is what the system this crate is modeled on uses, and swapping it for a
//! stronger hash would only churn the version key without changing any
//! observable behavior.

use crate::descriptor::ServerDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DescribedDigest(String);

impl DescribedDigest {
    pub fn of(descriptor: &ServerDescriptor) -> Self {
        Self::of_text(&descriptor.tool_description())
    }

    pub fn of_text(text: &str) -> Self {
        let digest = md5::compute(text.as_bytes());
        Self(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DescribedDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_text_same_digest() {
        assert_eq!(
            DescribedDigest::of_text("hello"),
            DescribedDigest::of_text("hello")
        );
    }

    #[test]
    fn different_text_different_digest() {
        assert_ne!(
            DescribedDigest::of_text("hello"),
            DescribedDigest::of_text("hello world")
        );
    }
}
