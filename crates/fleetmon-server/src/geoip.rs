use std::net::IpAddr;

/// Country-code lookup over an optional MaxMind database. Absent or broken
/// databases degrade to empty codes; geolocation is best-effort.
pub struct GeoIpResolver {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
}

impl GeoIpResolver {
    pub fn open(path: &str) -> Self {
        if path.is_empty() {
            return Self { reader: None };
        }
        match maxminddb::Reader::open_readfile(path) {
            Ok(reader) => Self {
                reader: Some(reader),
            },
            Err(e) => {
                tracing::warn!(path, error = %e, "geoip database unavailable");
                Self { reader: None }
            }
        }
    }

    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        let reader = self.reader.as_ref()?;
        let country: maxminddb::geoip2::Country = reader.lookup(ip).ok()?;
        country
            .country
            .and_then(|c| c.iso_code)
            .map(|code| code.to_lowercase())
    }
}
