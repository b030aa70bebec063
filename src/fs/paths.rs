//! Caller path <-> storage key translation.
//!
//! Callers address files with `/`-rooted paths (`/docs/a.txt`), the bucket
//! with flat keys (`docs/a.txt`). Directories exist implicitly through key
//! prefixes; an empty directory is kept alive by a zero-length marker object
//! named [`MARKER_NAME`] inside it.

/// The caller's root. It maps to itself, never to an empty key.
pub const ROOT: &str = "/";

/// Name of the placeholder object that makes an empty directory visible.
pub const MARKER_NAME: &str = ".bucketfs-folder";

const SEPARATOR: char = '/';

pub fn is_root(path: &str) -> bool {
    path.chars().all(|c| c == SEPARATOR || c == '\\')
}

/// Translate a caller path into a storage key.
pub fn to_storage_key(path: &str) -> String {
    if is_root(path) {
        return ROOT.to_string();
    }
    path.replace('\\', "/")
        .trim_matches(SEPARATOR)
        .to_string()
}

/// Key of the marker object for the directory at `path`.
pub fn to_directory_marker_key(path: &str) -> String {
    let key = to_storage_key(path);
    if key == ROOT {
        MARKER_NAME.to_string()
    } else {
        format!("{}/{}", key, MARKER_NAME)
    }
}

/// Reinterpret a listed key: marker objects become their directory's key.
/// Returns `None` for keys that name no entry of their own (the root marker).
pub fn from_listing_key(key: &str) -> Option<(String, bool)> {
    if key == MARKER_NAME {
        return None;
    }
    match key.strip_suffix(MARKER_NAME) {
        Some(dir) if dir.ends_with(SEPARATOR) => {
            Some((dir.trim_end_matches(SEPARATOR).to_string(), true))
        }
        _ => Some((key.to_string(), false)),
    }
}

/// Prefix every key under the directory `key` starts with.
pub fn child_prefix(key: &str) -> String {
    if key == ROOT {
        String::new()
    } else {
        format!("{}/", key)
    }
}

/// Immediate child of `prefix` that `key` lives under, and whether `key`
/// is nested deeper than that child.
pub fn immediate_child<'a>(prefix: &str, key: &'a str) -> Option<(&'a str, bool)> {
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() {
        return None;
    }
    match rest.find(SEPARATOR) {
        Some(0) => None,
        Some(i) => Some((&rest[..i], true)),
        None => Some((rest, false)),
    }
}

/// Final component of a caller path.
pub fn file_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEPARATOR);
    trimmed
        .rsplit(SEPARATOR)
        .next()
        .unwrap_or(trimmed)
}

/// Caller path of the directory containing `path`.
pub fn parent(path: &str) -> &str {
    let trimmed = path.trim_end_matches(SEPARATOR);
    match trimmed.rfind(SEPARATOR) {
        Some(0) | None => ROOT,
        Some(i) => &trimmed[..i],
    }
}

/// Join a caller directory path and a child name.
pub fn join(parent: &str, name: &str) -> String {
    if is_root(parent) {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent.trim_end_matches(SEPARATOR), name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_the_leading_separator() {
        assert_eq!(to_storage_key("/a/b.txt"), "a/b.txt");
        assert_eq!(to_storage_key("\\a\\b.txt"), "a/b.txt");
        assert_eq!(to_storage_key("/a/"), "a");
    }

    #[test]
    fn root_maps_to_itself() {
        assert_eq!(to_storage_key(ROOT), ROOT);
        assert_eq!(to_storage_key(&to_storage_key(ROOT)), ROOT);
        assert_eq!(to_storage_key("\\"), ROOT);
    }

    #[test]
    fn translation_is_idempotent() {
        for path in ["/a", "/a/b/c.txt", "plain", "/", "/x/"] {
            let once = to_storage_key(path);
            assert_eq!(to_storage_key(&once), once, "path {:?}", path);
        }
    }

    #[test]
    fn marker_keys_live_inside_their_directory() {
        assert_eq!(to_directory_marker_key("/empty"), format!("empty/{}", MARKER_NAME));
        assert_eq!(to_directory_marker_key("/a/b/"), format!("a/b/{}", MARKER_NAME));
        assert_eq!(to_directory_marker_key(ROOT), MARKER_NAME);
    }

    #[test]
    fn listing_reinterprets_markers() {
        let marker = to_directory_marker_key("/a/empty");
        assert_eq!(from_listing_key(&marker), Some(("a/empty".to_string(), true)));
        assert_eq!(from_listing_key("a/b.txt"), Some(("a/b.txt".to_string(), false)));
        assert_eq!(from_listing_key(MARKER_NAME), None);
        // A file that merely ends with the marker name is not a marker.
        let lookalike = format!("a/x{}", MARKER_NAME);
        assert_eq!(from_listing_key(&lookalike), Some((lookalike.clone(), false)));
    }

    #[test]
    fn immediate_children() {
        assert_eq!(immediate_child("", "a/b.txt"), Some(("a", true)));
        assert_eq!(immediate_child("", "top.txt"), Some(("top.txt", false)));
        assert_eq!(immediate_child("a/", "a/b.txt"), Some(("b.txt", false)));
        assert_eq!(immediate_child("a/", "a/"), None);
        assert_eq!(immediate_child("a/", "ab/c"), None);
        assert_eq!(child_prefix(ROOT), "");
        assert_eq!(child_prefix("a"), "a/");
    }

    #[test]
    fn names_and_joins() {
        assert_eq!(file_name("/a/b.txt"), "b.txt");
        assert_eq!(file_name("/a/"), "a");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
        assert_eq!(parent("/a/b.txt"), "/a");
        assert_eq!(parent("/a"), ROOT);
        assert_eq!(parent(ROOT), ROOT);
    }
}
