//! Conflict file naming
//!
//! When both sides changed a file, the server version keeps the original
//! path and the local version moves aside as
//! `<base> (conflicted copy <date> <hhmmss>).<ext>`.

use chrono::{DateTime, Utc};

use davsync_core::domain::RelativePath;

/// The name of the conflict copy for `original` at `moment`.
pub fn conflict_file_name(original: &str, moment: DateTime<Utc>) -> String {
    let stamp = moment.format("%Y-%m-%d %H%M%S");
    match original.rfind('.') {
        // a leading dot is a hidden file, not an extension
        Some(idx) if idx > 0 => {
            let (stem, ext) = original.split_at(idx);
            format!("{stem} (conflicted copy {stamp}){ext}")
        }
        _ => format!("{original} (conflicted copy {stamp})"),
    }
}

/// The conflict path next to `path`, unique against `exists`.
pub fn conflict_path<F>(path: &RelativePath, moment: DateTime<Utc>, mut exists: F) -> RelativePath
where
    F: FnMut(&RelativePath) -> bool,
{
    let name = path.file_name().unwrap_or_default();
    let parent = path.parent().unwrap_or_else(RelativePath::root);

    let candidate = |n: &str| parent.join(n).unwrap_or_else(|_| path.clone());

    let base = conflict_file_name(name, moment);
    let mut result = candidate(&base);
    let mut counter = 2;
    while exists(&result) && counter < 100 {
        let numbered = match base.rfind('.') {
            Some(idx) if idx > 0 => {
                let (stem, ext) = base.split_at(idx);
                format!("{stem} {counter}{ext}")
            }
            _ => format!("{base} {counter}"),
        };
        result = candidate(&numbered);
        counter += 1;
    }
    result
}
