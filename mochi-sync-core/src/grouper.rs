//! Groups source paths by parent directory, shallowest directories first.
//!
//! Deck resolution relies on the order: when a directory's group is handed
//! out, every ancestor directory that also has a group has already been
//! handed out, because it has a strictly lower depth.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

/// Source files sharing one parent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryGroup {
    /// Root-anchored directory path (`/` for the root).
    pub dir: String,
    /// File paths in insertion order.
    pub paths: Vec<String>,
    pub depth: usize,
}

/// Root-anchored parent directory of `path`. `/a/b.md` → `/a`, `/b.md` → `/`.
pub fn parent_dir(path: &str) -> String {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

/// Number of separators in a directory path; the root has depth 0.
pub fn depth(dir: &str) -> usize {
    if dir == "/" || dir.is_empty() {
        0
    } else {
        dir.trim_end_matches('/').matches('/').count()
    }
}

/// Incremental grouping queue: push paths in any order, pop groups in depth order.
///
/// Pushing a path into a directory that was already popped starts a new group
/// for that directory.
#[derive(Debug, Default)]
pub struct DirectoryQueue {
    groups: BTreeMap<String, Vec<String>>,
    heap: BinaryHeap<Reverse<(usize, String)>>,
}

impl DirectoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: impl Into<String>) {
        let path = path.into();
        let dir = parent_dir(&path);
        let paths = self.groups.entry(dir.clone()).or_default();
        if paths.is_empty() {
            self.heap.push(Reverse((depth(&dir), dir)));
        }
        paths.push(path);
    }

    pub fn pop(&mut self) -> Option<DirectoryGroup> {
        let Reverse((depth, dir)) = self.heap.pop()?;
        let paths = self.groups.remove(&dir).unwrap_or_default();
        Some(DirectoryGroup { dir, paths, depth })
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Group `paths` by parent directory, ascending by depth, ties by directory.
pub fn group<I, S>(paths: I) -> Vec<DirectoryGroup>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut queue = DirectoryQueue::new();
    for path in paths {
        queue.push(path);
    }
    std::iter::from_fn(|| queue.pop()).collect()
}
