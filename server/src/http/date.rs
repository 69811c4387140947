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

//! RFC-1123 GMT date formatting, backed by `httpdate`.

use std::time::SystemTime;

/// Formats `time` as an RFC-1123 date string, e.g.
/// `Tue, 15 Nov 1994 08:12:31 GMT`.
pub fn format(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}

/// The current time, formatted the same way, for the `Date` header.
pub fn now() -> String {
    format(SystemTime::now())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn formats_known_instant() {
        let time = UNIX_EPOCH + Duration::from_secs(784_887_151);
        assert_eq!("Tue, 15 Nov 1994 08:12:31 GMT", format(time));
    }
}
