use std::{net::IpAddr, str::FromStr};

use ipnet::IpNet;

use crate::error::ScanError;

/// An empty allowlist permits every target.
pub fn in_scope(target: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }

    let host = host_of(target).to_ascii_lowercase();
    if allowlist.iter().any(|item| {
        let item = item.to_ascii_lowercase();
        match item.strip_prefix("*.") {
            Some(suffix) => host.ends_with(&format!(".{suffix}")),
            None => item == host,
        }
    }) {
        return true;
    }

    if let Ok(ip) = IpAddr::from_str(&host) {
        return allowlist.iter().any(|entry| {
            IpNet::from_str(entry)
                .map(|net| net.contains(&ip))
                .unwrap_or(false)
        });
    }

    false
}

/// Normalizes a target address and checks it against the allowlist.
pub fn validate_target(target: &str, allowlist: &[String]) -> Result<String, ScanError> {
    let target = target.trim().to_ascii_lowercase();
    if target.is_empty() {
        return Err(ScanError::Validation("target is required".into()));
    }
    if target.starts_with('-') || target.chars().any(char::is_whitespace) {
        return Err(ScanError::Validation(format!("malformed target: {target}")));
    }
    if !in_scope(&target, allowlist) {
        return Err(ScanError::Validation(format!("target out of scope: {target}")));
    }
    Ok(target)
}

/// Strips scheme, path and port so `https://a.example.com:8443/x` scopes as
/// `a.example.com`.
pub fn host_of(target: &str) -> &str {
    let rest = target.split_once("://").map_or(target, |(_, r)| r);
    let rest = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    if rest.starts_with('[') {
        return rest
            .trim_start_matches('[')
            .split(']')
            .next()
            .unwrap_or(rest);
    }
    match rest.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => rest,
    }
}
