use crate::error::{LookupError, StartupError};
use maxminddb::{MaxMindDBError, Reader, geoip2};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

/// Placeholder written into every location field when the lookup gave up.
/// Kept distinct from "" which means the database simply had no data.
pub const NOT_AVAILABLE: &str = "N/A";

const LOCATE_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CityRecord {
    pub country: Option<String>,
    pub iso_code: Option<String>,
    pub city: Option<String>,
    pub subdivisions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsnRecord {
    pub number: Option<u32>,
    pub organization: Option<String>,
}

pub trait GeoDatabase: Send + Sync {
    fn lookup_city(&self, ip: IpAddr) -> Result<CityRecord, LookupError>;
}

pub trait AsnDatabase: Send + Sync {
    fn lookup_asn(&self, ip: IpAddr) -> Result<AsnRecord, LookupError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub country: String,
    pub iso_code: String,
    pub city: String,
    pub region: String,
    pub province: String,
}

impl Location {
    fn unavailable() -> Self {
        Self {
            country: NOT_AVAILABLE.to_string(),
            iso_code: NOT_AVAILABLE.to_string(),
            city: NOT_AVAILABLE.to_string(),
            region: NOT_AVAILABLE.to_string(),
            province: NOT_AVAILABLE.to_string(),
        }
    }

    fn from_record(record: CityRecord) -> Self {
        let mut subdivisions = record.subdivisions.into_iter();
        Self {
            country: record.country.unwrap_or_default(),
            iso_code: record.iso_code.unwrap_or_default(),
            city: record.city.unwrap_or_default(),
            region: subdivisions.next().unwrap_or_default(),
            province: subdivisions.next().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationInfo {
    Found(Location),
    Unavailable,
}

impl LocationInfo {
    /// Flattens into the persisted field set; `Unavailable` becomes all "N/A".
    pub fn into_location(self) -> Location {
        match self {
            Self::Found(location) => location,
            Self::Unavailable => Location::unavailable(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorInfo {
    Found(AsnRecord),
    Unavailable,
}

impl OperatorInfo {
    pub fn isp(&self) -> String {
        match self {
            Self::Found(record) => record
                .organization
                .clone()
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            Self::Unavailable => NOT_AVAILABLE.to_string(),
        }
    }
}

/// Location and network-operator lookups with the retry and fallback policy
/// applied. Never fails; degraded results are logged.
pub struct GeoEnricher {
    city: Box<dyn GeoDatabase>,
    asn: Box<dyn AsnDatabase>,
}

impl GeoEnricher {
    pub fn new(city: Box<dyn GeoDatabase>, asn: Box<dyn AsnDatabase>) -> Self {
        Self { city, asn }
    }

    pub fn locate(&self, addr: &str) -> LocationInfo {
        let Ok(ip) = addr.parse::<IpAddr>() else {
            tracing::warn!(addr, "geo: not an ip address");
            return LocationInfo::Unavailable;
        };

        for attempt in 1..=LOCATE_ATTEMPTS {
            match self.city.lookup_city(ip) {
                Ok(record) => return LocationInfo::Found(Location::from_record(record)),
                Err(err) => {
                    tracing::warn!(%ip, %err, attempt, max = LOCATE_ATTEMPTS, "geo: location lookup failed, retrying");
                }
            }
        }

        tracing::warn!(%ip, attempts = LOCATE_ATTEMPTS, "geo: location unavailable");
        LocationInfo::Unavailable
    }

    pub fn operator(&self, addr: &str) -> OperatorInfo {
        let Ok(ip) = addr.parse::<IpAddr>() else {
            return OperatorInfo::Unavailable;
        };
        match self.asn.lookup_asn(ip) {
            Ok(record) => OperatorInfo::Found(record),
            Err(err) => {
                tracing::warn!(%ip, %err, "geo: operator lookup failed");
                OperatorInfo::Unavailable
            }
        }
    }
}

pub struct MaxMindCity {
    reader: Reader<Vec<u8>>,
}

impl MaxMindCity {
    pub fn open(path: &Path) -> Result<Self, StartupError> {
        Ok(Self {
            reader: open_reader(path)?,
        })
    }
}

impl GeoDatabase for MaxMindCity {
    fn lookup_city(&self, ip: IpAddr) -> Result<CityRecord, LookupError> {
        let city: geoip2::City = self.reader.lookup(ip).map_err(|e| lookup_error(ip, e))?;

        let country = city.country.as_ref();
        Ok(CityRecord {
            country: country.and_then(|c| english(c.names.as_ref())),
            iso_code: country.and_then(|c| c.iso_code).map(str::to_string),
            city: city.city.as_ref().and_then(|c| english(c.names.as_ref())),
            subdivisions: city
                .subdivisions
                .iter()
                .flatten()
                .map(|s| english(s.names.as_ref()).unwrap_or_default())
                .collect(),
        })
    }
}

pub struct MaxMindAsn {
    reader: Reader<Vec<u8>>,
}

impl MaxMindAsn {
    pub fn open(path: &Path) -> Result<Self, StartupError> {
        Ok(Self {
            reader: open_reader(path)?,
        })
    }
}

impl AsnDatabase for MaxMindAsn {
    fn lookup_asn(&self, ip: IpAddr) -> Result<AsnRecord, LookupError> {
        let asn: geoip2::Asn = self.reader.lookup(ip).map_err(|e| lookup_error(ip, e))?;
        Ok(AsnRecord {
            number: asn.autonomous_system_number,
            organization: asn.autonomous_system_organization.map(str::to_string),
        })
    }
}

fn open_reader(path: &Path) -> Result<Reader<Vec<u8>>, StartupError> {
    Reader::open_readfile(path).map_err(|err| StartupError::MissingGeoDatabase {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

fn lookup_error(ip: IpAddr, err: MaxMindDBError) -> LookupError {
    match err {
        MaxMindDBError::AddressNotFoundError(_) => LookupError::NotFound(ip),
        other => LookupError::Malformed(other.to_string()),
    }
}

fn english(names: Option<&BTreeMap<&str, &str>>) -> Option<String> {
    names.and_then(|n| n.get("en")).map(|s| s.to_string())
}
