//! Host allow-list matching shared by the HTTP and SOCKS5 proxies.

/// Immutable host filter. Both proxies read it concurrently without
/// synchronization.
#[derive(Debug, Default)]
pub struct DomainFilter {
    allow_all: bool,
    exact: Vec<String>,
    wildcard_suffixes: Vec<String>,
}

impl DomainFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from an allow-list; an empty list allows everything.
    pub fn from_allowed_hosts(hosts: &[String]) -> Self {
        let mut filter = Self::new();
        if hosts.is_empty() {
            filter.allow_all();
        } else {
            for host in hosts {
                filter.add_allowed(host);
            }
        }
        filter
    }

    pub fn allow_all(&mut self) {
        self.allow_all = true;
    }

    /// Add an exact host or a `*.suffix` wildcard rule.
    pub fn add_allowed(&mut self, rule: &str) {
        let rule = strip_host_port(rule.trim()).to_lowercase();
        if rule.is_empty() {
            return;
        }

        if let Some(suffix) = rule.strip_prefix("*.") {
            if !suffix.is_empty() {
                // Stored with the leading dot so ends_with cannot match
                // the bare suffix itself.
                self.wildcard_suffixes.push(format!(".{suffix}"));
            }
        } else {
            self.exact.push(rule);
        }
    }

    /// Whether `host` (optionally `host:port` or `[v6]:port`) is allowed.
    pub fn is_allowed(&self, host: &str) -> bool {
        if self.allow_all {
            return true;
        }

        let host = strip_host_port(host).to_lowercase();

        self.exact.iter().any(|rule| *rule == host)
            || self.wildcard_suffixes.iter().any(|suffix| host.ends_with(suffix.as_str()))
    }
}

/// Strip a `:port` suffix and IPv6 brackets. A bare IPv6 address (more
/// than one colon, no brackets) passes through untouched.
fn strip_host_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
        return rest;
    }

    match host.rfind(':') {
        Some(idx) if host[..idx].find(':').is_none() => {
            let port = &host[idx + 1..];
            if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
                &host[..idx]
            } else {
                host
            }
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(allowed: &[&str]) -> DomainFilter {
        let hosts: Vec<String> = allowed.iter().map(|s| s.to_string()).collect();
        DomainFilter::from_allowed_hosts(&hosts)
    }

    #[test]
    fn matches_hosts_against_rules() {
        struct Case {
            name: &'static str,
            allowed: &'static [&'static str],
            host: &'static str,
            want: bool,
        }

        let cases = [
            Case { name: "empty filter allows all", allowed: &[], host: "example.com", want: true },
            Case { name: "exact match allowed", allowed: &["api.github.com"], host: "api.github.com", want: true },
            Case { name: "exact match with port", allowed: &["api.github.com"], host: "api.github.com:443", want: true },
            Case { name: "case insensitive", allowed: &["API.GitHub.com"], host: "api.github.com", want: true },
            Case { name: "not in allow list", allowed: &["api.github.com"], host: "evil.com", want: false },
            Case { name: "exact does not match subdomain", allowed: &["a.b"], host: "x.a.b", want: false },
            Case { name: "exact does not match suffix", allowed: &["a.b"], host: "b", want: false },
            Case { name: "wildcard subdomain match", allowed: &["*.github.com"], host: "api.github.com", want: true },
            Case { name: "wildcard matches nested subdomain", allowed: &["*.github.com"], host: "api.v2.github.com", want: true },
            Case { name: "wildcard does not match base domain", allowed: &["*.github.com"], host: "github.com", want: false },
            Case { name: "wildcard is case insensitive", allowed: &["*.GitHub.com"], host: "API.github.COM", want: true },
            Case { name: "multiple allowed hosts", allowed: &["api.github.com", "httpbin.org"], host: "httpbin.org", want: true },
            Case { name: "mixed exact and wildcard", allowed: &["api.github.com", "*.example.com"], host: "test.example.com", want: true },
            Case { name: "IPv4 address with port", allowed: &["127.0.0.1"], host: "127.0.0.1:8080", want: true },
            Case { name: "IPv6 address with brackets", allowed: &["[::1]"], host: "[::1]:8080", want: true },
        ];

        for case in cases {
            let f = filter(case.allowed);
            assert_eq!(f.is_allowed(case.host), case.want, "{}", case.name);
        }
    }

    #[test]
    fn allow_all_mode() {
        let mut f = DomainFilter::new();
        assert!(!f.is_allowed("anything.com"));
        f.allow_all();
        assert!(f.is_allowed("anything.com"));
    }

    #[test]
    fn empty_rules_are_ignored() {
        let mut f = DomainFilter::new();
        f.add_allowed("");
        f.add_allowed("   ");
        assert!(!f.is_allowed("example.com"));
    }

    #[test]
    fn strips_ports_and_brackets() {
        assert_eq!(strip_host_port("a.b:8080"), "a.b");
        assert_eq!(strip_host_port("a.b"), "a.b");
        assert_eq!(strip_host_port("[::1]:443"), "::1");
        assert_eq!(strip_host_port("[::1]"), "::1");
        assert_eq!(strip_host_port("::1"), "::1");
        assert_eq!(strip_host_port("a.b:"), "a.b:");
        assert_eq!(strip_host_port("a.b:notaport"), "a.b:notaport");
    }
}
