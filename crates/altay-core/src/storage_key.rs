use serde::Serialize;
use std::fmt;

const UNSAFE_PATH_CHARS: [char; 4] = [':', '.', '/', '\\'];
const SAFE_SUBSTITUTE: char = ';';

/// Name of the storage location for one `(label, remote address)` pair.
///
/// Always derived from the pair, never stored on its own, so it cannot drift
/// from the identity it names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(label: &str, remote_address: &str) -> Self {
        Self(sanitize_segment(&format!("{label}@{remote_address}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StorageKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Replaces characters that cannot appear in a single path segment.
pub fn sanitize_segment(raw: &str) -> String {
    raw.chars()
        .map(|ch| {
            if UNSAFE_PATH_CHARS.contains(&ch) {
                SAFE_SUBSTITUTE
            } else {
                ch
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_and_ipv6_addresses_are_flattened() {
        assert_eq!(
            StorageKey::new("Chrome", "192.168.1.20").as_str(),
            "Chrome@192;168;1;20"
        );
        assert_eq!(StorageKey::new("Edge", "::1").as_str(), "Edge@;;1");
    }

    #[test]
    fn labels_cannot_escape_the_storage_root() {
        let key = StorageKey::new("../../etc", "10.0.0.1");
        assert_eq!(key.as_str(), ";;;;;;etc@10;0;0;1");
        assert!(!key.as_str().contains('/'));
        assert!(!StorageKey::new("a\\b", "h").as_str().contains('\\'));
    }

    #[test]
    fn distinct_pairs_can_collide_only_through_sanitising() {
        assert_ne!(StorageKey::new("chrome", "10.0.0.1"), StorageKey::new("chrome", "10.0.0.2"));
        assert_eq!(StorageKey::new("v1.0", "h"), StorageKey::new("v1:0", "h"));
    }
}
