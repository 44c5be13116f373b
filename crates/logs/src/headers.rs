//! Backend request headers mounted from a secret directory: one file per
//! header, file name is the header name, trimmed contents the value.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

/// Read every regular, non-hidden file in `dir` as a header. Symlinks are
/// followed: a Secret volume exposes each key as `name -> ..data/name`.
pub fn load_headers(dir: &Path) -> io::Result<HashMap<String, String>> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    let mut out = HashMap::new();
    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !entry.path().is_file() {
            continue;
        }
        let value = fs::read_to_string(entry.path())?;
        debug!(header = %name, "loaded backend header");
        out.insert(name, value.trim().to_string());
    }
    Ok(out)
}

/// Like [`load_headers`], but an unset or unreadable directory yields no
/// headers and a warning.
pub fn load_headers_or_empty(dir: Option<&Path>) -> HashMap<String, String> {
    let Some(dir) = dir else {
        return HashMap::new();
    };
    match load_headers(dir) {
        Ok(h) => h,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "unable to read log backend headers; continuing without them");
            HashMap::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_files_as_trimmed_headers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Authorization"), "Bearer abc\n").unwrap();
        fs::write(dir.path().join("X-Tenant"), "  team-a ").unwrap();
        fs::write(dir.path().join(".hidden"), "nope").unwrap();
        fs::create_dir(dir.path().join("..data")).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();

        let h = load_headers(dir.path()).unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h["Authorization"], "Bearer abc");
        assert_eq!(h["X-Tenant"], "team-a");
    }

    #[cfg(unix)]
    #[test]
    fn follows_secret_volume_symlinks() {
        use std::os::unix::fs::symlink;

        let dir = tempfile::tempdir().unwrap();
        let versioned = dir.path().join("..2026_10_19_12_00_00.000000001");
        fs::create_dir(&versioned).unwrap();
        fs::write(versioned.join("Authorization"), "Bearer abc\n").unwrap();
        symlink("..2026_10_19_12_00_00.000000001", dir.path().join("..data")).unwrap();
        symlink("..data/Authorization", dir.path().join("Authorization")).unwrap();
        // dangling links are not headers
        symlink("..data/Gone", dir.path().join("Gone")).unwrap();

        let h = load_headers(dir.path()).unwrap();
        assert_eq!(h.len(), 1, "{h:?}");
        assert_eq!(h.get("Authorization").map(String::as_str), Some("Bearer abc"));
    }

    #[test]
    fn missing_directory_is_empty_when_lenient() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("absent");
        assert!(load_headers(&gone).is_err());
        assert!(load_headers_or_empty(Some(&gone)).is_empty());
        assert!(load_headers_or_empty(None).is_empty());
    }
}
