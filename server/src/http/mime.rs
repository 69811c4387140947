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

//! MIME-type lookup by file extension, backed by `mime_guess`.

use std::path::Path;

/// Looks up the MIME type for `path` by extension, falling back to
/// `application/octet-stream` for unknown or missing extensions (spec
/// §4.5 "default application/octet-stream").
pub fn lookup(path: &Path) -> &'static str {
    mime_guess::from_path(path).first_raw().unwrap_or("application/octet-stream")
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn looks_up_known_extension() {
        assert_eq!("text/html", lookup(&PathBuf::from("index.html")));
    }

    #[test]
    fn falls_back_for_unknown_extension() {
        assert_eq!("application/octet-stream", lookup(&PathBuf::from("file.unknownext")));
    }

    #[test]
    fn falls_back_with_no_extension() {
        assert_eq!("application/octet-stream", lookup(&PathBuf::from("Makefile")));
    }
}
