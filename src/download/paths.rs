use std::path::{Path, PathBuf};

/// Clean a filename by removing characters that are invalid on common
/// filesystems: `/`, `\`, `:`, `*`, `?`, `"`, `<`, `>`, `|`, and control
/// characters.
pub fn clean_filename(filename: &str) -> String {
    filename
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect()
}

/// Split `name` into stem and extension (extension keeps its dot).
///
/// A leading dot is part of the stem, so `.env` has no extension.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if dot > 0 => name.split_at(dot),
        _ => (name, ""),
    }
}

/// Insert a numeric collision counter before the extension.
///
/// `"video.mp4"` with `2` becomes `"video_2.mp4"`.
pub fn insert_counter(filename: &str, counter: u32) -> String {
    let (stem, ext) = split_extension(filename);
    let mut result = String::with_capacity(filename.len() + 11);
    result.push_str(stem);
    result.push('_');
    result.push_str(&counter.to_string());
    result.push_str(ext);
    result
}

/// First path under `dir` for `filename` that `exists` reports as free,
/// trying `filename`, then `stem_1.ext`, `stem_2.ext`, …
pub fn unique_path(dir: &Path, filename: &str, exists: impl Fn(&Path) -> bool) -> PathBuf {
    let candidate = dir.join(filename);
    if !exists(&candidate) {
        return candidate;
    }
    let mut counter = 1u32;
    loop {
        let candidate = dir.join(insert_counter(filename, counter));
        if !exists(&candidate) {
            return candidate;
        }
        counter = counter.saturating_add(1);
    }
}

/// Conflict-free staging path for an item, checked against the local
/// scratch directory at assignment time.
pub fn staging_path(staging_dir: &Path, filename: &str) -> PathBuf {
    unique_path(staging_dir, filename, |p| p.symlink_metadata().is_ok())
}
