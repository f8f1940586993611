//! The component reference grammar used at the tool surface:
//!
//! `[type::]{repository}[/{prefix}]/{component}[:{version}]`
//!
//! `repository` and `component` can both contain `/`, so the split is
//! resolved in order of preference by an explicit `//` separator, the
//! well-known prefix segment, or the URL authority. When no `type::` is
//! given, the repository shape decides: URL-ish means OCI, path-ish means
//! CTF.

use nom::{Parser, branch::alt, bytes::complete::tag, combinator::opt};

pub const DEFAULT_PREFIX: &str = "component-descriptors";

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    Empty,
    MissingComponent,
    EmptyVersion,
    EmptyRepository,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryKind {
    Oci,
    Ctf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentRef {
    pub kind: RepositoryKind,
    pub repository: String,
    pub prefix: String,
    pub component: String,
    pub version: Option<String>,
}

fn parse_type_prefix(input: &str) -> (Option<RepositoryKind>, &str) {
    let mut parser = opt(alt((
        tag::<_, _, nom::error::Error<&str>>("oci::"),
        tag("ctf::"),
    )));
    match parser.parse(input) {
        Ok((rest, Some("oci::"))) => (Some(RepositoryKind::Oci), rest),
        Ok((rest, Some("ctf::"))) => (Some(RepositoryKind::Ctf), rest),
        _ => (None, input),
    }
}

// the version separator is the last ':' that comes after the last '/', so
// ports (host:5000/...) never match
fn split_version(input: &str) -> Result<(&str, Option<&str>), Error> {
    let last_slash = input.rfind('/');
    match input.rfind(':') {
        Some(colon) if last_slash.is_none_or(|s| colon > s) => {
            // a scheme colon like "https://" has no slash before it either,
            // but then there is a '/' directly after, which a version can't have
            if input[colon + 1..].contains('/') {
                return Ok((input, None));
            }
            let version = &input[colon + 1..];
            if version.is_empty() {
                return Err(Error::EmptyVersion);
            }
            Ok((&input[..colon], Some(version)))
        }
        _ => Ok((input, None)),
    }
}

fn looks_like_path(repository: &str) -> bool {
    repository.starts_with('/')
        || repository.starts_with("./")
        || repository.starts_with("../")
        || repository.ends_with(".tar")
        || repository.ends_with(".tgz")
        || repository.ends_with(".tar.gz")
}

/// Parse a component reference. The component part must be non-empty; the
/// prefix defaults to `component-descriptors` when the reference doesn't
/// spell it out.
pub fn parse(input: &str) -> Result<ComponentRef, Error> {
    if input.is_empty() {
        return Err(Error::Empty);
    }
    let (explicit_kind, rest) = parse_type_prefix(input);
    let (rest, version) = split_version(rest)?;

    // strip the scheme so "//" below means the explicit separator, not "://"
    let (scheme, body) = match rest.split_once("://") {
        Some((s, b)) => (Some(s), b),
        None => (None, rest),
    };

    let (repo_body, prefix, component) = if let Some((repo, comp)) = body.split_once("//") {
        (repo, DEFAULT_PREFIX.to_string(), comp)
    } else if let Some(pos) = find_prefix_segment(body) {
        let repo = &body[..pos.saturating_sub(1)];
        let comp = &body[pos + DEFAULT_PREFIX.len() + 1..];
        (repo, DEFAULT_PREFIX.to_string(), comp)
    } else {
        // URL shape: authority is the repository, the rest is the component
        let (authority, comp) = body.split_once('/').ok_or(Error::MissingComponent)?;
        (authority, DEFAULT_PREFIX.to_string(), comp)
    };

    if component.is_empty() {
        return Err(Error::MissingComponent);
    }
    if repo_body.is_empty() {
        return Err(Error::EmptyRepository);
    }

    let repository = match scheme {
        Some(s) => format!("{}://{}", s, repo_body),
        None => repo_body.to_string(),
    };

    let kind = explicit_kind.unwrap_or(if scheme.is_some() {
        RepositoryKind::Oci
    } else if looks_like_path(&repository) {
        RepositoryKind::Ctf
    } else {
        RepositoryKind::Oci
    });

    Ok(ComponentRef {
        kind,
        repository,
        prefix,
        component: component.to_string(),
        version: version.map(str::to_string),
    })
}

// byte offset of a whole path segment equal to the default prefix; only
// counts when there is a repository before it and a component after it
fn find_prefix_segment(body: &str) -> Option<usize> {
    let mut offset = 0;
    for segment in body.split('/') {
        if segment == DEFAULT_PREFIX
            && offset > 0
            && offset + DEFAULT_PREFIX.len() + 1 < body.len()
        {
            return Some(offset);
        }
        offset += segment.len() + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_oci_reference() {
        let r = parse(
            "oci::https://ghcr.io/acme/component-descriptors/ocm.software/tool:0.23.0",
        )
        .unwrap();
        assert_eq!(r.kind, RepositoryKind::Oci);
        assert_eq!(r.repository, "https://ghcr.io/acme");
        assert_eq!(r.prefix, DEFAULT_PREFIX);
        assert_eq!(r.component, "ocm.software/tool");
        assert_eq!(r.version.as_deref(), Some("0.23.0"));
    }

    #[test]
    fn test_double_slash_separator() {
        let r = parse("ctf::./transport-archive//ocm.software/tool:1.0.0").unwrap();
        assert_eq!(r.kind, RepositoryKind::Ctf);
        assert_eq!(r.repository, "./transport-archive");
        assert_eq!(r.component, "ocm.software/tool");
        assert_eq!(r.version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn test_heuristic_dispatch() {
        // url shape means oci
        let r = parse("https://example.com:5000/ocm.software/tool").unwrap();
        assert_eq!(r.kind, RepositoryKind::Oci);
        assert_eq!(r.repository, "https://example.com:5000");
        assert_eq!(r.version, None);
        // path shape means ctf
        let r = parse("./archive.tar.gz//ocm.software/tool").unwrap();
        assert_eq!(r.kind, RepositoryKind::Ctf);
        // bare host defaults to oci
        let r = parse("ghcr.io/acme/tool").unwrap();
        assert_eq!(r.kind, RepositoryKind::Oci);
        assert_eq!(r.repository, "ghcr.io");
        assert_eq!(r.component, "acme/tool");
    }

    #[test]
    fn test_port_is_not_a_version() {
        let r = parse("oci::https://localhost:5000/comp-name").unwrap();
        assert_eq!(r.repository, "https://localhost:5000");
        assert_eq!(r.component, "comp-name");
        assert_eq!(r.version, None);
    }

    #[test]
    fn test_errors() {
        assert_eq!(parse(""), Err(Error::Empty));
        assert_eq!(parse("oci::ghcr.io"), Err(Error::MissingComponent));
        assert_eq!(
            parse("ghcr.io/acme/tool:"),
            Err(Error::EmptyVersion)
        );
    }
}
