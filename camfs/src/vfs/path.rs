//! Path helpers. Paths are absolute and `/`-separated; empty segments are
//! ignored, so `//DCIM/` and `/DCIM` name the same folder.

pub fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Device folder string for a segment list: `/` for the root.
pub fn folder_of(segs: &[&str]) -> String {
    format!("/{}", segs.join("/"))
}

pub fn normalize(path: &str) -> String {
    folder_of(&segments(path))
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == "/" || parent.is_empty() {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

/// Parent folder and final name. `None` for the root.
pub fn split_parent(path: &str) -> Option<(String, String)> {
    let segs = segments(path);
    let (name, parents) = segs.split_last()?;
    Some((folder_of(parents), (*name).to_string()))
}

/// Names a single directory entry can never take.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}
