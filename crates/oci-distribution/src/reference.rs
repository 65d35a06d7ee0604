use std::convert::TryFrom;
use std::error::Error;
use std::fmt;
use std::str::FromStr;

/// NAME_TOTAL_LENGTH_MAX is the maximum total number of characters in a repository name.
const NAME_TOTAL_LENGTH_MAX: usize = 255;

/// TAG_LENGTH_MAX is the maximum number of characters in a tag.
const TAG_LENGTH_MAX: usize = 128;

/// The host Docker Hub images are actually served from.
const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// Reasons a string cannot be turned into a [`Reference`].
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The digest is not of the form `<algorithm>:<hex>`
    DigestInvalidFormat,
    /// The repository name has uppercase characters
    NameContainsUppercase,
    /// The repository name is empty
    NameEmpty,
    /// The repository name is longer than [`NAME_TOTAL_LENGTH_MAX`]
    NameTooLong,
    /// The reference has no registry component
    ReferenceInvalidFormat,
    /// The tag has characters a tag may not contain
    TagInvalidFormat,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::DigestInvalidFormat => write!(f, "invalid digest format"),
            ParseError::NameContainsUppercase => write!(f, "repository name must be lowercase"),
            ParseError::NameEmpty => write!(f, "repository name must have at least one component"),
            ParseError::NameTooLong => write!(
                f,
                "repository name must not be more than {} characters",
                NAME_TOTAL_LENGTH_MAX
            ),
            ParseError::ReferenceInvalidFormat => write!(f, "invalid reference format"),
            ParseError::TagInvalidFormat => write!(f, "invalid tag format"),
        }
    }
}

impl Error for ParseError {}

/// Reference provides a general type to represent any way of referencing images within an OCI registry.
///
/// # Examples
///
/// Parsing a reference to an image by digest, the form image catalogs record
/// for mirrored content:
///
/// ```
/// use oci_distribution::Reference;
///
/// let reference: Reference = "quay.io/coreos/etcd@sha256:958608f8ecc1dc62c93b6c610f3a834dae4220c9642e6e8b4e0f2b3ad7cbd238".parse().unwrap();
///
/// assert_eq!("quay.io", reference.registry());
/// assert_eq!("coreos/etcd", reference.repository());
/// assert_eq!(None, reference.tag());
/// assert_eq!(Some("sha256:958608f8ecc1dc62c93b6c610f3a834dae4220c9642e6e8b4e0f2b3ad7cbd238"), reference.digest());
/// ```
#[derive(Clone, Hash, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl Reference {
    /// Build a reference to content identified by digest within a repository.
    pub fn with_digest(registry: &str, repository: &str, digest: &str) -> Self {
        Reference {
            registry: registry.to_owned(),
            repository: repository.to_owned(),
            tag: None,
            digest: Some(digest.to_owned()),
        }
    }

    /// registry returns the name of the registry.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// resolve_registry returns the host that actually serves the registry.
    ///
    /// This only differs from [`Reference::registry`] for Docker Hub, whose
    /// canonical name is not the host serving the v2 API.
    pub fn resolve_registry(&self) -> &str {
        resolve_registry_name(&self.registry)
    }

    /// repository returns the name of the repository.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// tag returns the object's tag, if present.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// digest returns the object's digest, if present.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// whole returns the whole reference.
    pub fn whole(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(t) = self.tag() {
            s.push(':');
            s.push_str(t);
        }
        if let Some(d) = self.digest() {
            s.push('@');
            s.push_str(d);
        }
        s
    }
}

/// The host serving the v2 API for a registry name.
pub(crate) fn resolve_registry_name(registry: &str) -> &str {
    match registry {
        "docker.io" | "index.docker.io" => DOCKER_HUB_REGISTRY,
        other => other,
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole())
    }
}

impl FromStr for Reference {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reference::try_from(s)
    }
}

fn valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => (),
        _ => return false,
    }
    tag.len() <= TAG_LENGTH_MAX
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
}

fn valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some((algorithm, hex)) => {
            !algorithm.is_empty()
                && !hex.is_empty()
                && algorithm
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

impl TryFrom<String> for Reference {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let repo_start = s.find('/').ok_or(ParseError::ReferenceInvalidFormat)?;
        let registry = &s[..repo_start];
        if registry.is_empty() {
            return Err(ParseError::ReferenceInvalidFormat);
        }

        // Everything after the first '@' is the digest. Repository paths never
        // contain a colon, so the last colon before the digest starts the tag.
        let rest = &s[repo_start + 1..];
        let (rest, digest) = match rest.split_once('@') {
            Some((r, d)) => (r, Some(d)),
            None => (rest, None),
        };
        let (repository, tag) = match rest.rfind(':') {
            Some(i) => (&rest[..i], Some(&rest[i + 1..])),
            None => (rest, None),
        };

        if repository.is_empty() {
            return Err(ParseError::NameEmpty);
        }
        if repository.len() > NAME_TOTAL_LENGTH_MAX {
            return Err(ParseError::NameTooLong);
        }
        if repository.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ParseError::NameContainsUppercase);
        }
        if let Some(t) = tag {
            if !valid_tag(t) {
                return Err(ParseError::TagInvalidFormat);
            }
        }
        if let Some(d) = digest {
            if !valid_digest(d) {
                return Err(ParseError::DigestInvalidFormat);
            }
        }

        Ok(Reference {
            registry: registry.to_owned(),
            repository: repository.to_owned(),
            tag: tag.map(str::to_owned),
            digest: digest.map(str::to_owned),
        })
    }
}

impl TryFrom<&str> for Reference {
    type Error = ParseError;
    fn try_from(string: &str) -> Result<Self, Self::Error> {
        TryFrom::try_from(string.to_owned())
    }
}

impl From<Reference> for String {
    fn from(reference: Reference) -> Self {
        reference.whole()
    }
}
