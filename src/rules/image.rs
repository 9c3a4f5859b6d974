//! Image reference normalization
//!
//! Rules are written against fully-qualified references, so every image is
//! normalized to carry an explicit registry host before matching:
//!
//! - `nginx:latest` -> `docker.io/library/nginx:latest`
//! - `myorg/app` -> `docker.io/myorg/app`
//! - `docker.io/caddy:2.7` -> `docker.io/library/caddy:2.7`
//! - `gcr.io/project/app`, `localhost:5000/app` -> unchanged

/// Registry assumed for references without an explicit host
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Namespace Docker Hub uses for official images
pub const OFFICIAL_NAMESPACE: &str = "library";

/// Split a reference into its registry host and the remaining path, if it
/// carries a host.
///
/// The first path component is a host when it is `localhost` (optionally
/// with a port) or looks like a DNS name: it contains a dot and ends in a
/// label of at least two letters, optionally followed by `:port`.
fn split_registry(image: &str) -> Option<(&str, &str)> {
    let (first, rest) = image.split_once('/')?;
    if is_localhost(first) || is_dns_host(first) {
        Some((first, rest))
    } else {
        None
    }
}

fn is_localhost(component: &str) -> bool {
    match component.strip_prefix("localhost") {
        Some("") => true,
        Some(port) => port
            .strip_prefix(':')
            .is_some_and(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit())),
        None => false,
    }
}

fn is_dns_host(component: &str) -> bool {
    let host = match component.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        Some(_) => return false,
        None => component,
    };

    let starts_alnum = host
        .bytes()
        .next()
        .is_some_and(|b| b.is_ascii_alphanumeric());
    let valid_chars = host
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));

    match host.rsplit_once('.') {
        Some((name, tld)) => {
            starts_alnum
                && valid_chars
                && !name.is_empty()
                && tld.len() >= 2
                && tld.bytes().all(|b| b.is_ascii_alphabetic())
        }
        None => false,
    }
}

/// Normalize an image reference so it always starts with a registry host.
///
/// References without a host get `docker.io/`. Docker Hub references whose
/// repository has a single path component (official images) additionally
/// get the `library/` namespace, matching how Docker Hub resolves them.
/// Everything after the inserted prefix is left untouched.
pub fn normalize_image(image: &str) -> String {
    match split_registry(image) {
        Some((host, path)) if host == DEFAULT_REGISTRY && is_official(path) => {
            format!("{}/{}/{}", host, OFFICIAL_NAMESPACE, path)
        }
        Some(_) => image.to_string(),
        None if is_official(image) => {
            format!("{}/{}/{}", DEFAULT_REGISTRY, OFFICIAL_NAMESPACE, image)
        }
        None => format!("{}/{}", DEFAULT_REGISTRY, image),
    }
}

/// True when a host-less path names a single-component repository
fn is_official(path: &str) -> bool {
    let repository = path.split_once('@').map_or(path, |(repo, _)| repo);
    !repository.contains('/')
}

/// Registry host of an image reference, used as a metrics label.
///
/// Returns `localhost` for any localhost registry, the host for references
/// that carry one, and `docker.io` otherwise.
pub fn registry_of(image: &str) -> &str {
    match split_registry(image) {
        Some((host, _)) if is_localhost(host) => "localhost",
        Some((host, _)) => host,
        None => DEFAULT_REGISTRY,
    }
}
