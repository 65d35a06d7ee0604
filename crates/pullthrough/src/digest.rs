//! Content digests.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A content digest of the form `<algorithm>:<hex>`.
///
/// Apart from the check in [`Digest::from_str`], which guards the HTTP
/// boundary, a digest is treated as an opaque value: it is compared, hashed
/// and formatted, never interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

/// Returned when a string is not a well formed digest.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid digest {0:?}")]
pub struct InvalidDigest(pub String);

impl Digest {
    /// Wrap a string without validating it.
    pub fn new_unchecked<S: Into<String>>(digest: S) -> Self {
        Digest(digest.into())
    }

    /// The digest as it appears on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The algorithm and hex parts, if the digest has the usual shape.
    pub(crate) fn split(&self) -> Option<(&str, &str)> {
        self.0.split_once(':')
    }
}

impl FromStr for Digest {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let valid = match s.split_once(':') {
            Some((algorithm, hex)) => {
                valid_algorithm(algorithm)
                    && hex.len() >= 32
                    && hex
                        .chars()
                        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
            }
            None => false,
        };
        if valid {
            Ok(Digest(s.to_owned()))
        } else {
            Err(InvalidDigest(s.to_owned()))
        }
    }
}

/// Algorithms are lowercase alphanumeric components joined by single
/// `+`, `.`, `_` or `-` separators.
fn valid_algorithm(algorithm: &str) -> bool {
    algorithm.split(|c| "+._-".contains(c)).all(|component| {
        !component.is_empty()
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    })
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_well_formed_digests() {
        let d: Digest = "sha256:958608f8ecc1dc62c93b6c610f3a834dae4220c9642e6e8b4e0f2b3ad7cbd238"
            .parse()
            .expect("valid digest");
        assert_eq!(
            Some((
                "sha256",
                "958608f8ecc1dc62c93b6c610f3a834dae4220c9642e6e8b4e0f2b3ad7cbd238"
            )),
            d.split()
        );
    }

    #[test]
    fn accepts_compound_algorithms() {
        for good in &[
            "sha512:958608f8ecc1dc62c93b6c610f3a834d",
            "multihash+base58:958608f8ecc1dc62c93b6c610f3a834d",
            "sha256.v2_x-y:958608f8ecc1dc62c93b6c610f3a834d",
        ] {
            assert!(good.parse::<Digest>().is_ok(), "{}", good);
        }
    }

    #[test]
    fn rejects_malformed_digests() {
        for bad in &[
            "",
            "sha256",
            "sha256:",
            ":958608f8ecc1dc62c93b6c610f3a834d",
            "SHA256:958608f8ecc1dc62c93b6c610f3a834d",
            "sha256:958608F8ECC1DC62C93B6C610F3A834D",
            "sha256:abc",
            "sha256:../../../../etc/passwd/000000000000000000",
            "..:958608f8ecc1dc62c93b6c610f3a834d",
            ".sha256:958608f8ecc1dc62c93b6c610f3a834d",
            "sha256+:958608f8ecc1dc62c93b6c610f3a834d",
            "sha--256:958608f8ecc1dc62c93b6c610f3a834d",
        ] {
            assert_eq!(Err(InvalidDigest(bad.to_string())), bad.parse::<Digest>());
        }
    }
}
