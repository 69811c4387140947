//! Representation of the requested HTTP version

use std::fmt::Display;

/// Representation of the requested HTTP version. Only `H1_0` and `H1_1` are
/// ever produced by the parser; `H2`/`H3` are reserved for the upgrade
/// detection the server performs before handing a connection to the H1
/// parser at all (see `server::job`), and are Non-goals for this parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}
