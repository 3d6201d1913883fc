use std::net::IpAddr;

use rand::Rng;

/// Mask the middle of an address for notification texts: `1.2.3.4` becomes
/// `1.****.4`, `2001:db8::beef:cafe` keeps its first and last two groups.
pub fn ip_desensitize(ip: &str) -> String {
    if ip.contains(':') {
        let groups: Vec<&str> = ip.split(':').collect();
        if groups.len() <= 4 {
            return ip.to_string();
        }
        format!(
            "{}:{}:****:{}:{}",
            groups[0],
            groups[1],
            groups[groups.len() - 2],
            groups[groups.len() - 1]
        )
    } else {
        let octets: Vec<&str> = ip.split('.').collect();
        if octets.len() != 4 {
            return ip.to_string();
        }
        format!("{}.****.{}", octets[0], octets[3])
    }
}

/// Pack a textual address into the canonical 16-byte form used as the WAF
/// primary key (IPv4 addresses are stored as v4-mapped v6).
pub fn ip_to_binary(ip: &str) -> Option<[u8; 16]> {
    let addr: IpAddr = ip.parse().ok()?;
    Some(match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    })
}

pub fn binary_to_ip(b: &[u8]) -> String {
    let Ok(bytes) = <[u8; 16]>::try_from(b) else {
        return "::".to_string();
    };
    let v6 = std::net::Ipv6Addr::from(bytes);
    match v6.to_ipv4_mapped() {
        Some(v4) => v4.to_string(),
        None => v6.to_string(),
    }
}

/// Extract the trusted address from a forwarding header value: the last
/// comma-separated entry is the one appended by the closest proxy.
pub fn ip_from_header(value: &str) -> Option<String> {
    let last = value.rsplit(',').next()?.trim();
    let addr: IpAddr = last.parse().ok()?;
    Some(addr.to_string())
}

/// Alphanumeric random string, used for generated secrets.
pub fn random_string(n: usize) -> String {
    const LETTERS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..n)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

/// Saturating unsigned subtraction; counters reported by agents can reset
/// below the last snapshot after a reboot.
pub fn sub_checked(a: u64, b: u64) -> u64 {
    a.saturating_sub(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desensitize_v4() {
        assert_eq!(ip_desensitize("1.2.3.4"), "1.****.4");
        assert_eq!(ip_desensitize("not-an-ip"), "not-an-ip");
    }

    #[test]
    fn desensitize_v6() {
        assert_eq!(
            ip_desensitize("2001:db8:1:2:3:4:beef:cafe"),
            "2001:db8:****:beef:cafe"
        );
    }

    #[test]
    fn binary_round_trip() {
        let b = ip_to_binary("192.0.2.7").unwrap();
        assert_eq!(binary_to_ip(&b), "192.0.2.7");

        let b6 = ip_to_binary("2001:db8::1").unwrap();
        assert_eq!(binary_to_ip(&b6), "2001:db8::1");

        assert!(ip_to_binary("").is_none());
        assert_eq!(binary_to_ip(&[1, 2, 3]), "::");
    }

    #[test]
    fn header_ip_takes_last_entry() {
        assert_eq!(
            ip_from_header("203.0.113.5, 198.51.100.9").as_deref(),
            Some("198.51.100.9")
        );
        assert!(ip_from_header("garbage").is_none());
    }

    #[test]
    fn random_string_length_and_charset() {
        let s = random_string(32);
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn sub_checked_saturates() {
        assert_eq!(sub_checked(10, 3), 7);
        assert_eq!(sub_checked(3, 10), 0);
    }
}
