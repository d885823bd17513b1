//! Address-and-port allow-list, used by [`HttpProxyHandler`](../reverse_httpproxy) as a
//! bypass/veto check before dialing a destination.
//!
//! A `Whitelist` is built from a comma-separated pattern list where each pattern is one of
//! `host`, `*.zone`, `IP`, `CIDR`, or `[IPv6]`, optionally suffixed `:port` or `:minPort-maxPort`.
//! [`Whitelist::contains`] is phrased as a veto: it returns `true` when the address does **not**
//! match any configured pattern and must therefore be blocked. An empty pattern list means "no
//! whitelist configured", which is equivalent to allow-all.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PortRange {
	min: u16,
	max: u16,
}

impl PortRange {
	const ANY: PortRange = PortRange { min: 0, max: 0 };

	fn matches(&self, port: u16) -> bool {
		if *self == Self::ANY {
			return true;
		}
		self.min <= port && port <= self.max
	}
}

#[derive(Debug, Clone)]
enum PatternKind {
	Cidr(IpNet),
	Ip(IpAddr),
	Zone(String),
	Host(String),
}

#[derive(Debug, Clone)]
struct Pattern {
	kind: PatternKind,
	ports: PortRange,
}

#[derive(Debug, Clone, Default)]
pub struct Whitelist {
	cidrs: Vec<Pattern>,
	ips: Vec<Pattern>,
	zones: Vec<Pattern>,
	hosts: Vec<Pattern>,
}

impl Whitelist {
	/// Parses a comma-separated pattern list. Entries that fail to parse are silently dropped, as
	/// the source tool does, rather than rejecting the whole configuration.
	pub fn parse(patterns: &str) -> Whitelist {
		let mut wl = Whitelist::default();
		for raw in patterns.split(',') {
			let raw = raw.trim();
			if raw.is_empty() {
				continue;
			}
			match parse_pattern(raw) {
				Some(p) => wl.insert(p),
				None => debug!(pattern = raw, "dropping unparsable whitelist entry"),
			}
		}
		wl
	}

	/// True when no patterns were configured at all (allow-all).
	pub fn is_empty(&self) -> bool {
		self.cidrs.is_empty() && self.ips.is_empty() && self.zones.is_empty() && self.hosts.is_empty()
	}

	fn insert(&mut self, p: Pattern) {
		match p.kind {
			PatternKind::Cidr(_) => self.cidrs.push(p),
			PatternKind::Ip(_) => self.ips.push(p),
			PatternKind::Zone(_) => self.zones.push(p),
			PatternKind::Host(_) => self.hosts.push(p),
		}
	}

	/// Returns `true` when `addr` (`host:port` or `[ipv6]:port`) must be blocked, i.e. it matched
	/// none of the configured patterns. An unconfigured whitelist never blocks anything.
	pub fn contains(&self, addr: &str) -> bool {
		if self.is_empty() {
			return false;
		}
		let Some((host, port)) = split_host_port(addr) else {
			return true;
		};
		let ip = IpAddr::from_str(&host).ok();

		if let Some(ip) = ip {
			for p in &self.cidrs {
				if let PatternKind::Cidr(net) = p.kind {
					if net.contains(&ip) && p.ports.matches(port) {
						return false;
					}
				}
			}
			for p in &self.ips {
				if let PatternKind::Ip(pip) = p.kind {
					if pip == ip && p.ports.matches(port) {
						return false;
					}
				}
			}
		}

		for p in &self.zones {
			if let PatternKind::Zone(zone) = &p.kind {
				let matches = host == *zone || host.ends_with(&format!(".{zone}"));
				if matches && p.ports.matches(port) {
					return false;
				}
			}
		}

		for p in &self.hosts {
			if let PatternKind::Host(h) = &p.kind {
				if *h == host && p.ports.matches(port) {
					return false;
				}
			}
		}

		true
	}
}

fn parse_pattern(raw: &str) -> Option<Pattern> {
	if let Some(slash) = raw.find('/') {
		// CIDR notation never carries a port suffix.
		let _ = slash;
		let net: IpNet = raw.parse().ok()?;
		return Some(Pattern {
			kind: PatternKind::Cidr(net),
			ports: PortRange::ANY,
		});
	}

	let (host_part, ports) = split_pattern_host_and_ports(raw)?;
	let host_part = host_part.trim_start_matches('[').trim_end_matches(']');

	if let Ok(ip) = IpAddr::from_str(host_part) {
		return Some(Pattern {
			kind: PatternKind::Ip(ip),
			ports,
		});
	}
	if let Some(zone) = host_part.strip_prefix("*.") {
		return Some(Pattern {
			kind: PatternKind::Zone(zone.to_string()),
			ports,
		});
	}
	Some(Pattern {
		kind: PatternKind::Host(host_part.to_string()),
		ports,
	})
}

fn split_pattern_host_and_ports(raw: &str) -> Option<(&str, PortRange)> {
	if let Some(rest) = raw.strip_prefix('[') {
		let close = rest.find(']')?;
		let host = &raw[..close + 2];
		let after = &rest[close + 1..];
		return match after.strip_prefix(':') {
			Some(p) => Some((host, parse_port_range(p)?)),
			None => Some((host, PortRange::ANY)),
		};
	}
	match raw.rsplit_once(':') {
		Some((host, port)) if looks_like_port_spec(port) => {
			Some((host, parse_port_range(port)?))
		},
		_ => Some((raw, PortRange::ANY)),
	}
}

fn looks_like_port_spec(s: &str) -> bool {
	let (min, max) = match s.split_once('-') {
		Some((a, b)) => (a, b),
		None => (s, s),
	};
	!min.is_empty() && !max.is_empty() && min.chars().all(|c| c.is_ascii_digit()) && max.chars().all(|c| c.is_ascii_digit())
}

fn parse_port_range(s: &str) -> Option<PortRange> {
	match s.split_once('-') {
		Some((min, max)) => Some(PortRange {
			min: min.parse().ok()?,
			max: max.parse().ok()?,
		}),
		None => {
			let port: u16 = s.parse().ok()?;
			Some(PortRange { min: port, max: port })
		},
	}
}

fn split_host_port(addr: &str) -> Option<(String, u16)> {
	if let Some(rest) = addr.strip_prefix('[') {
		let close = rest.find(']')?;
		let host = rest[..close].to_string();
		let after = &rest[close + 1..];
		let port: u16 = after.strip_prefix(':')?.parse().ok()?;
		return Some((host, port));
	}
	let (host, port) = addr.rsplit_once(':')?;
	Some((host.to_string(), port.parse().ok()?))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn wl() -> Whitelist {
		Whitelist::parse("localhost,*.zone,127.0.0.1,10.0.0.1/8,1000::/16")
	}

	#[test]
	fn allowed_addresses_are_not_blocked() {
		let wl = wl();
		for addr in [
			"localhost:123",
			"zone:123",
			"foo.zone:123",
			"127.0.0.1:123",
			"10.1.2.3:123",
			"[1000::]:123",
		] {
			assert!(!wl.contains(addr), "{addr} should be allowed");
		}
	}

	#[test]
	fn unlisted_addresses_are_blocked() {
		let wl = wl();
		for addr in [
			"example.com:123",
			"1.2.3.4:123",
			"[1001::]:123",
			"172.217.7.14:443",
			"[2607:f8b0:4006:800::200e]:443",
			"example.com:80",
		] {
			assert!(wl.contains(addr), "{addr} should be blocked");
		}
	}

	#[test]
	fn port_ranges_are_enforced() {
		let wl = Whitelist::parse("localhost:4000-5000");
		assert!(!wl.contains("localhost:4000"));
		assert!(!wl.contains("localhost:4500"));
		assert!(!wl.contains("localhost:5000"));
		assert!(wl.contains("localhost:3999"));
		assert!(wl.contains("localhost:5001"));
	}

	#[test]
	fn unconfigured_whitelist_allows_everything() {
		let wl = Whitelist::parse("");
		assert!(!wl.contains("example.com:80"));
	}

	#[test]
	fn unparsable_entries_are_dropped_not_fatal() {
		let wl = Whitelist::parse("not a valid / / cidr///,localhost");
		assert!(!wl.contains("localhost:80"));
	}
}
