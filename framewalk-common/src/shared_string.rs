//! A cheaply clonable, immutable string handle.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// An immutable, reference-counted string.
///
/// Function and module names surface many times during an unwind: once per
/// frame, once per symbol-cache entry, and once per formatter line. Passing
/// a `SharedString` around clones an `Arc` instead of the bytes, so all of
/// those places end up pointing at one allocation.
#[derive(Clone, Default, Eq, Hash, Ord, PartialOrd)]
pub struct SharedString(Option<Arc<str>>);

impl SharedString {
    /// Creates a new empty string handle.
    pub fn new() -> Self {
        SharedString(None)
    }

    /// Returns the underlying string slice.
    pub fn as_str(&self) -> &str {
        match self.0 {
            Some(ref inner) => inner,
            None => "",
        }
    }

    /// Returns true if this handle holds no characters.
    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }
}

impl Deref for SharedString {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl Borrow<str> for SharedString {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for SharedString {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<&str> for SharedString {
    fn from(string: &str) -> Self {
        if string.is_empty() {
            SharedString(None)
        } else {
            SharedString(Some(Arc::from(string)))
        }
    }
}

impl From<String> for SharedString {
    fn from(string: String) -> Self {
        SharedString::from(string.as_str())
    }
}

impl PartialEq for SharedString {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl PartialEq<str> for SharedString {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for SharedString {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl fmt::Display for SharedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for SharedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sharing() {
        let name = SharedString::from("SignalInnerFunction");
        let copy = name.clone();
        assert_eq!(name, copy);
        assert_eq!(name.as_str(), "SignalInnerFunction");
    }

    #[test]
    fn test_empty() {
        let empty = SharedString::new();
        assert!(empty.is_empty());
        assert_eq!(empty, SharedString::from(""));
        assert_eq!(empty.as_str(), "");
    }
}
