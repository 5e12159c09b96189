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

//! User-aware admission control.
//!
//! Derives a stable identity from the request, then runs it through the
//! tiered rate limiter. Runs as middleware before any handler; downstream
//! components only read the derived identity, they never consume a second
//! admission ticket.

mod identity;
mod rate_limit;

pub use identity::{TrustedProxies, UserIdentity};
pub use rate_limit::{GateDecision, TieredRateLimiter};

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use axum::http::HeaderMap;

use crate::config::GateConfig;

/// The admission gate: identity derivation plus rate limiting.
pub struct AdmissionGate {
    trusted: TrustedProxies,
    user_id_header: String,
    client_id_header: String,
    user_tier_header: String,
    enable_proxy_headers: bool,
    tiers: BTreeMap<String, u32>,
    limiter: TieredRateLimiter,
}

impl AdmissionGate {
    pub fn new(config: &GateConfig, tiers: BTreeMap<String, u32>) -> Self {
        let trusted = match TrustedProxies::parse(&config.trusted_proxy_ips) {
            Ok(trusted) => trusted,
            Err(bad) => {
                // Misconfiguration is non-fatal: logged once, the bad
                // entries are skipped.
                tracing::warn!("Ignoring invalid trusted_proxy_ips entries: {:?}", bad.rejected);
                bad.parsed
            }
        };

        let limiter = TieredRateLimiter::new(
            Duration::from_secs(config.rate_limit_window),
            Duration::from_secs_f64(config.min_interval_per_user),
            config.max_tracked_identities,
        );

        Self {
            trusted,
            user_id_header: config.user_id_header.clone(),
            client_id_header: config.client_id_header.clone(),
            user_tier_header: config.user_tier_header.clone(),
            enable_proxy_headers: config.enable_proxy_headers,
            tiers,
            limiter,
        }
    }

    /// Derive identity and consume one admission ticket.
    pub fn admit(&self, headers: &HeaderMap, peer: IpAddr) -> (UserIdentity, GateDecision) {
        let identity = self.identify(headers, peer);
        let limit = self
            .tiers
            .get(&identity.tier)
            .copied()
            .unwrap_or_else(|| self.tiers.get("default").copied().unwrap_or(u32::MAX));
        let decision = self.limiter.check(&identity.user_id, limit);
        (identity, decision)
    }

    /// Identity derivation only, no ticket consumed. Used by handlers that
    /// need the identity after middleware already admitted the request.
    pub fn identify(&self, headers: &HeaderMap, peer: IpAddr) -> UserIdentity {
        let peer_trusted = self.trusted.contains(peer);

        let user_id = self
            .header_identity(headers, peer_trusted)
            .unwrap_or_else(|| self.ip_identity(headers, peer, peer_trusted));

        let tier = headers
            .get(&self.user_tier_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| self.tiers.contains_key(*t))
            .unwrap_or("default")
            .to_string();

        UserIdentity {
            user_id,
            tier,
            source_ip: peer,
            peer_trusted,
        }
    }

    pub fn tracked_identities(&self) -> u64 {
        self.limiter.tracked()
    }

    fn header_identity(&self, headers: &HeaderMap, peer_trusted: bool) -> Option<String> {
        // 1. Explicit user id, only from a trusted proxy.
        if self.enable_proxy_headers && peer_trusted {
            if let Some(id) = non_empty_header(headers, &self.user_id_header) {
                return Some(format!("user:{id}"));
            }
        }

        // 2. Client id from any peer.
        if let Some(id) = non_empty_header(headers, &self.client_id_header) {
            return Some(format!("client:{id}"));
        }

        // 3. Bearer token / API key, hashed so the raw credential never
        //    lands in logs or bucket keys.
        if let Some(auth) = non_empty_header(headers, "authorization") {
            let token = auth.strip_prefix("Bearer ").unwrap_or(&auth);
            return Some(format!("key:{}", identity::hash_credential(token)));
        }

        None
    }

    fn ip_identity(&self, headers: &HeaderMap, peer: IpAddr, peer_trusted: bool) -> String {
        // 4. Source address. Forwarded headers are only believed when the
        //    peer itself is a trusted proxy.
        if self.enable_proxy_headers && peer_trusted {
            if let Some(forwarded) = non_empty_header(headers, "x-forwarded-for") {
                if let Some(first) = forwarded.split(',').next() {
                    if let Ok(ip) = first.trim().parse::<IpAddr>() {
                        return format!("ip:{ip}");
                    }
                }
            }
            if let Some(real_ip) = non_empty_header(headers, "x-real-ip") {
                if let Ok(ip) = real_ip.trim().parse::<IpAddr>() {
                    return format!("ip:{ip}");
                }
            }
        }
        format!("ip:{peer}")
    }
}

fn non_empty_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
