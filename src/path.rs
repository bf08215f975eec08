//! Change paths: `user.name`, `items[2]`, `items[2].title`.
//!
//! A path is related to another when it equals it or one is a segment-aware
//! prefix of the other (`a` relates to `a.b` and `a[0]`, but not to `ab`).

use indexmap::IndexSet;

pub type PathSet = IndexSet<String>;

pub fn child_path(root: &str, key: &str, array_like: bool) -> String {
    if root.is_empty() {
        key.to_string()
    } else if array_like {
        format!("{}[{}]", root, key)
    } else {
        format!("{}.{}", root, key)
    }
}

/// Leading identifier of a path.
pub fn root_of(path: &str) -> &str {
    let end = path.find(['.', '[']).unwrap_or(path.len());
    &path[..end]
}

/// True when `path` lies strictly below `ancestor`.
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && matches!(path.as_bytes()[ancestor.len()], b'.' | b'[')
}

pub fn related(a: &str, b: &str) -> bool {
    a == b || is_descendant(a, b) || is_descendant(b, a)
}

pub fn intersects<'a, R, C>(reads: R, changes: C) -> bool
where
    R: IntoIterator<Item = &'a String>,
    C: IntoIterator<Item = &'a String> + Clone,
{
    reads
        .into_iter()
        .any(|read| changes.clone().into_iter().any(|change| related(read, change)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_path_forms() {
        assert_eq!(child_path("", "user", false), "user");
        assert_eq!(child_path("user", "name", false), "user.name");
        assert_eq!(child_path("items", "2", true), "items[2]");
    }

    #[test]
    fn test_related_is_segment_aware() {
        assert!(related("a", "a.b"));
        assert!(related("a.b.c", "a"));
        assert!(related("items", "items[0].x"));
        assert!(!related("a", "ab"));
        assert!(!related("a.b", "a.c"));
        assert_eq!(root_of("items[0].name"), "items");
    }

    #[test]
    fn test_intersects() {
        let reads: PathSet = ["state".to_string(), "other".to_string()].into_iter().collect();
        let changes: PathSet = ["state.list".to_string()].into_iter().collect();
        assert!(intersects(&reads, &changes));
        let unrelated: PathSet = ["stately".to_string()].into_iter().collect();
        assert!(!intersects(&reads, &unrelated));
    }
}
