//! Source file enumeration.

use std::fs;
use std::path::Path;

use tracing::debug;

/// Recursively list files under `root` whose extension is in `extensions`,
/// as sorted root-anchored paths (`/a/note.md`). Hidden files and
/// directories are skipped.
pub fn list_paths(root: &Path, extensions: &[String]) -> std::io::Result<Vec<String>> {
    fn visit_dir(
        dir: &Path,
        prefix: &str,
        extensions: &[String],
        results: &mut Vec<String>,
    ) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                debug!(path = %entry.path().display(), "Skipping non UTF-8 path");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let file_type = entry.file_type()?;
            let rel = format!("{prefix}/{name}");
            if file_type.is_dir() {
                visit_dir(&entry.path(), &rel, extensions, results)?;
            } else if file_type.is_file() {
                let matches = Path::new(name)
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)));
                if matches {
                    results.push(rel);
                }
            }
        }
        Ok(())
    }

    let mut results = Vec::new();
    visit_dir(root, "", extensions, &mut results)?;
    results.sort();
    debug!(root = %root.display(), count = results.len(), "Listed source files");
    Ok(results)
}
