// Copyright 2025 Ragstone (https://github.com/ragstone)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::net::IpAddr;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Identity derived for one request. `user_id` is prefixed by its source
/// (`user:` / `client:` / `key:` / `ip:`) so identities from different
/// derivation steps never collide.
#[derive(Debug, Clone, Serialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub tier: String,
    pub source_ip: IpAddr,
    /// Whether the peer was inside the trusted-proxy set; forwarded
    /// headers were only honored when true.
    pub peer_trusted: bool,
}

/// Hash an API key or bearer token into a short stable identity fragment.
pub fn hash_credential(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..8])
}

/// A set of CIDR blocks. Plain addresses are accepted as /32 (v4) or
/// /128 (v6).
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    nets: Vec<(IpAddr, u8)>,
}

/// Partial parse result: the valid entries plus whatever was rejected.
pub struct PartialParse {
    pub parsed: TrustedProxies,
    pub rejected: Vec<String>,
}

impl TrustedProxies {
    /// Parse CIDR strings; returns Err with the partial set when any entry
    /// is invalid so the caller can log once and continue.
    pub fn parse(entries: &[String]) -> Result<Self, PartialParse> {
        let mut nets = Vec::new();
        let mut rejected = Vec::new();

        for entry in entries {
            match parse_cidr(entry) {
                Some(net) => nets.push(net),
                None => rejected.push(entry.clone()),
            }
        }

        let parsed = Self { nets };
        if rejected.is_empty() {
            Ok(parsed)
        } else {
            Err(PartialParse { parsed, rejected })
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.nets.iter().any(|(net, prefix)| cidr_match(ip, *net, *prefix))
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}

fn parse_cidr(entry: &str) -> Option<(IpAddr, u8)> {
    let entry = entry.trim();
    match entry.split_once('/') {
        Some((addr, prefix)) => {
            let addr: IpAddr = addr.parse().ok()?;
            let prefix: u8 = prefix.parse().ok()?;
            let max = if addr.is_ipv4() { 32 } else { 128 };
            (prefix <= max).then_some((addr, prefix))
        }
        None => {
            let addr: IpAddr = entry.parse().ok()?;
            let prefix = if addr.is_ipv4() { 32 } else { 128 };
            Some((addr, prefix))
        }
    }
}

fn cidr_match(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            if prefix == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - prefix as u32);
            (u32::from(ip) & mask) == (u32::from(net) & mask)
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            if prefix == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - prefix as u32);
            (u128::from(ip) & mask) == (u128::from(net) & mask)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxies(entries: &[&str]) -> TrustedProxies {
        TrustedProxies::parse(&entries.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .unwrap_or_else(|partial| partial.parsed)
    }

    #[test]
    fn test_exact_address_match() {
        let set = proxies(&["127.0.0.1"]);
        assert!(set.contains("127.0.0.1".parse().unwrap()));
        assert!(!set.contains("127.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_cidr_block_match() {
        let set = proxies(&["10.0.0.0/8", "192.168.1.0/24"]);
        assert!(set.contains("10.255.3.4".parse().unwrap()));
        assert!(set.contains("192.168.1.200".parse().unwrap()));
        assert!(!set.contains("192.168.2.1".parse().unwrap()));
        assert!(!set.contains("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_ipv6_match() {
        let set = proxies(&["::1/128", "fd00::/8"]);
        assert!(set.contains("::1".parse().unwrap()));
        assert!(set.contains("fd12:3456::1".parse().unwrap()));
        assert!(!set.contains("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_entries_are_reported() {
        let entries = vec!["10.0.0.0/8".to_string(), "not-an-ip".to_string()];
        let err = TrustedProxies::parse(&entries).err().expect("should report");
        assert_eq!(err.rejected, vec!["not-an-ip"]);
        assert!(err.parsed.contains("10.1.1.1".parse().unwrap()));
    }

    #[test]
    fn test_v4_never_matches_v6_net() {
        let set = proxies(&["::1/128"]);
        assert!(!set.contains("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_credential_hash_is_stable_and_short() {
        let a = hash_credential("token-a");
        assert_eq!(a, hash_credential("token-a"));
        assert_ne!(a, hash_credential("token-b"));
        assert_eq!(a.len(), 16);
    }
}
