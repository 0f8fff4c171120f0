//! GeoIP enrichment backed by a MaxMind city database.

use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use maxminddb::geoip2;

use super::Enricher;
use crate::error::{CoreError, Result};
use crate::models::{GeoContext, RawEvent};

pub struct GeoIpEnricher {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
}

impl GeoIpEnricher {
    /// Open the database at `path`. With no path configured the enricher
    /// stays registered but disabled.
    pub fn new(path: Option<&str>) -> Result<Self> {
        let reader = match path {
            None => None,
            Some(path) => {
                let reader = maxminddb::Reader::open_readfile(Path::new(path))
                    .map_err(|e| CoreError::config(format!("failed to open geoip db: {e}")))?;
                tracing::info!(path, "geoip database loaded");
                Some(reader)
            }
        };
        Ok(Self { reader })
    }

    fn lookup(&self, ip: IpAddr) -> Option<GeoContext> {
        let reader = self.reader.as_ref()?;
        let city: geoip2::City = reader.lookup(ip).ok()?;
        Some(GeoContext {
            country_iso_code: city
                .country
                .as_ref()
                .and_then(|c| c.iso_code)
                .map(str::to_string),
            country_name: city
                .country
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(|names| names.get("en"))
                .map(|s| s.to_string()),
            city_name: city
                .city
                .as_ref()
                .and_then(|c| c.names.as_ref())
                .and_then(|names| names.get("en"))
                .map(|s| s.to_string()),
            latitude: city.location.as_ref().and_then(|l| l.latitude),
            longitude: city.location.as_ref().and_then(|l| l.longitude),
        })
    }
}

#[async_trait]
impl Enricher for GeoIpEnricher {
    fn name(&self) -> &'static str {
        "geoip"
    }

    fn enabled(&self) -> bool {
        self.reader.is_some()
    }

    async fn enrich(&self, event: &mut RawEvent) -> Result<()> {
        let Some(network) = event.network.as_ref() else {
            return Ok(());
        };

        // Prefer the remote side of the connection.
        let candidate = network
            .destination_ip
            .parse::<IpAddr>()
            .or_else(|_| network.source_ip.parse::<IpAddr>());
        if let Ok(ip) = candidate {
            if let Some(geo) = self.lookup(ip) {
                event.enrichment.geo = Some(geo);
            }
        }
        Ok(())
    }
}
