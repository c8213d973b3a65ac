//! Path manipulation utilities

/// Normalize a caller-supplied archive name: backslashes become forward
/// slashes and leading slashes are stripped, so every stored name is relative
/// and `/`-separated.
pub fn sanitize_name(name: &str) -> String {
    name.replace('\\', "/").trim_start_matches('/').to_string()
}

/// Final path segment of a stored name, or `""` for a directory marker.
pub(crate) fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Segments of a stored name that are safe to recreate on disk. Empty and
/// `..` segments are dropped so extraction can never climb out of its
/// destination.
pub(crate) fn safe_segments(name: &str) -> impl Iterator<Item = &str> {
    name.split('/').filter(|seg| !seg.is_empty() && *seg != "..")
}
