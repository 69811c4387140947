// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request-target → filesystem-path resolution,
//! including the directory-traversal guard (Testable Property 3).

use std::fs;
use std::path::{Path, PathBuf};

use percent_encoding::percent_decode_str;

use crate::error::PathError;

/// The resolved, `stat`-ed target of a request.
#[derive(Debug)]
pub struct Resolved {
    pub path: PathBuf,
    pub metadata: fs::Metadata,
}

/// Resolves `target` (the raw, still percent-encoded request target,
/// query string and all) against `root` in six steps: truncate the query
/// string, percent-decode, join against the root, default to `index.html`,
/// canonicalize with a containment check, then stat.
pub fn resolve(target: &str, root: &Path) -> Result<Resolved, PathError> {
    // 1. Truncate at the first '?'.
    let path_part = target.split('?').next().unwrap_or("");

    // 2. Percent-decode; '+' maps to space.
    let plus_replaced = path_part.replace('+', " ");
    validate_percent_escapes(&plus_replaced)?;
    let decoded = percent_decode_str(&plus_replaced)
        .decode_utf8()
        .map_err(|_| PathError::BadEncoding)?
        .into_owned();

    // 3. root + decoded_prefix.
    let mut candidate = root.to_path_buf();
    for segment in decoded.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        candidate.push(segment);
    }

    // 4. Empty target, or one ending in '/', serves index.html.
    if decoded.is_empty() || decoded.ends_with('/') {
        candidate.push("index.html");
    }

    // 5. Canonicalize and verify containment.
    let canonical_root = fs::canonicalize(root).map_err(PathError::NotFound)?;
    let canonical = fs::canonicalize(&candidate).map_err(PathError::NotFound)?;
    if !is_contained(&canonical, &canonical_root) {
        return Err(PathError::Traversal);
    }

    // 6. stat; if a directory, retry at its index.html.
    let metadata = fs::metadata(&canonical).map_err(PathError::NotFound)?;
    if metadata.is_dir() {
        let with_index = canonical.join("index.html");
        let canonical = fs::canonicalize(&with_index).map_err(PathError::NotFound)?;
        if !is_contained(&canonical, &canonical_root) {
            return Err(PathError::Traversal);
        }
        let metadata = fs::metadata(&canonical).map_err(PathError::NotFound)?;
        return Ok(Resolved { path: canonical, metadata });
    }

    Ok(Resolved { path: canonical, metadata })
}

/// Rejects a `%` not followed by exactly two hex digits, the malformed-escape
/// case `percent_decode_str` otherwise passes through as a literal `%`.
fn validate_percent_escapes(s: &str) -> Result<(), PathError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3);
            let valid = hex.map(|h| h.iter().all(|b| b.is_ascii_hexdigit())).unwrap_or(false);
            if !valid {
                return Err(PathError::BadEncoding);
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// `true` iff `candidate` is `root` itself or lies strictly beneath it —
/// the directory-traversal guard, phrased positively via `Path::strip_prefix`.
fn is_contained(candidate: &Path, root: &Path) -> bool {
    candidate.strip_prefix(root).is_ok()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("index.html")).unwrap().write_all(b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        File::create(dir.path().join("sub").join("index.html")).unwrap().write_all(b"sub").unwrap();
        dir
    }

    #[test]
    fn resolves_root_to_index() {
        let dir = fixture();
        let resolved = resolve("/", dir.path()).unwrap();
        assert_eq!(resolved.path, fs::canonicalize(dir.path().join("index.html")).unwrap());
    }

    #[test]
    fn resolves_directory_to_its_index() {
        let dir = fixture();
        let resolved = resolve("/sub", dir.path()).unwrap();
        assert_eq!(resolved.path, fs::canonicalize(dir.path().join("sub/index.html")).unwrap());
    }

    #[test]
    fn rejects_dotdot_traversal() {
        let dir = fixture();
        assert!(matches!(resolve("/../etc/passwd", dir.path()), Err(PathError::Traversal) | Err(PathError::NotFound(_))));
    }

    #[test]
    fn rejects_percent_encoded_traversal() {
        let dir = fixture();
        assert!(matches!(resolve("/%2e%2e/etc/passwd", dir.path()), Err(PathError::Traversal) | Err(PathError::NotFound(_))));
    }

    #[test]
    fn rejects_malformed_percent_encoding() {
        let dir = fixture();
        // %ff decodes to a lone non-UTF-8 byte.
        assert!(matches!(resolve("/%ff", dir.path()), Err(PathError::BadEncoding)));
    }

    #[test]
    fn rejects_malformed_percent_escape_syntax() {
        let dir = fixture();
        assert!(matches!(resolve("/%zz", dir.path()), Err(PathError::BadEncoding)));
        assert!(matches!(resolve("/%g0", dir.path()), Err(PathError::BadEncoding)));
        assert!(matches!(resolve("/foo%2", dir.path()), Err(PathError::BadEncoding)));
    }

    #[test]
    fn strips_query_string_before_resolving() {
        let dir = fixture();
        let resolved = resolve("/index.html?foo=bar", dir.path()).unwrap();
        assert_eq!(resolved.path, fs::canonicalize(dir.path().join("index.html")).unwrap());
    }
}
