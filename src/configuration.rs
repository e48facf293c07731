use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::OnceLock;

/// Property key carrying the capability bitmask of a service.
pub const FLAGS_KEY: &str = "flags";

/// Property key carrying the `x,y,z` location of a service.
pub const LOCATION_KEY: &str = "location";

/// Network interface index meaning "any interface".
pub const INTERFACE_UNSPECIFIED: i32 = -1;

/// IP protocol a service instance was seen on.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Hash, PartialEq, Eq)]
pub enum Protocol {
    IPv4,
    IPv6,
    #[default]
    Unspecified,
}

/// The tuple that uniquely identifies a service instance within one browser.
#[derive(Clone, Debug, Serialize, Deserialize, Hash, PartialEq, Eq)]
pub struct ServiceKey {
    pub name: String,
    pub service_type: String,
    pub domain: String,
    pub interface: i32,
    pub protocol: Protocol,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{} (if={}, {:?})",
            self.name, self.service_type, self.domain, self.interface, self.protocol
        )
    }
}

/// Capability bits a service can advertise through its `flags` property.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Hash, PartialEq, Eq)]
pub struct Flags(u32);

impl Flags {
    pub const BUSY: Flags = Flags(1);
    pub const READY: Flags = Flags(2);
    pub const SLAM: Flags = Flags(4);
    pub const MANIPULATOR: Flags = Flags(8);
    pub const REMOTE: Flags = Flags(16);

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Flags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is also set in `self`.
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Renders the bitmask as a `flags=<bits>` property string.
    pub fn to_property(self) -> String {
        format!("{}={}", FLAGS_KEY, self.0)
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Flags {
    type Output = Flags;

    fn bitand(self, rhs: Flags) -> Flags {
        Flags(self.0 & rhs.0)
    }
}

/// A point in the shared coordinate frame services report their location in.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Position { x, y, z }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        let (dx, dy, dz) = (self.x - other.x, self.y - other.y, self.z - other.z);
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    /// Renders the position as a `location=x,y,z` property string.
    pub fn to_property(&self) -> String {
        format!("{}={},{},{}", LOCATION_KEY, self.x, self.y, self.z)
    }

    fn parse(value: &str) -> Option<Position> {
        let mut parts = value.split(',').map(|p| p.trim().parse::<f64>());
        let position = Position::new(
            parts.next()?.ok()?,
            parts.next()?.ok()?,
            parts.next()?.ok()?,
        );
        if parts.next().is_some() {
            return None;
        }
        Some(position)
    }
}

/// Splits a raw property entry into its key and value.
///
/// Unkeyed flag tokens yield the whole token as key and an empty value.
pub(crate) fn split_property(entry: &str) -> (&str, &str) {
    entry.split_once('=').unwrap_or((entry, ""))
}

/// The identity and decoded TXT properties of one discovered service instance.
///
/// Values are replaced wholesale on update, so a clone handed out earlier
/// never changes underneath its holder.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    name: String,
    service_type: String,
    domain: String,
    interface: i32,
    protocol: Protocol,
    port: Option<u16>,
    properties: Vec<String>,
    #[serde(skip)]
    lookup: OnceLock<HashMap<String, String>>,
}

impl ServiceConfiguration {
    pub fn new(
        name: impl Into<String>,
        service_type: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        ServiceConfiguration {
            name: name.into(),
            service_type: service_type.into(),
            domain: domain.into(),
            interface: INTERFACE_UNSPECIFIED,
            protocol: Protocol::Unspecified,
            port: None,
            properties: Vec::new(),
            lookup: OnceLock::new(),
        }
    }

    pub fn with_interface(mut self, interface: i32, protocol: Protocol) -> Self {
        self.interface = interface;
        self.protocol = protocol;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = properties.into_iter().map(Into::into).collect();
        self.lookup = OnceLock::new();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn interface(&self) -> i32 {
        self.interface
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Raw property entries in the order they were announced.
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            name: self.name.clone(),
            service_type: self.service_type.clone(),
            domain: self.domain.clone(),
            interface: self.interface,
            protocol: self.protocol,
        }
    }

    /// Looks up a value by label.
    ///
    /// `name`, `type` and `domain` resolve to the identity fields; every other
    /// label goes through the key→value map built from the properties, where
    /// the last entry for a key wins.
    pub fn get(&self, label: &str) -> Option<&str> {
        match label {
            "name" => Some(&self.name),
            "type" => Some(&self.service_type),
            "domain" => Some(&self.domain),
            _ => self.lookup().get(label).map(String::as_str),
        }
    }

    /// Every value a wildcard label is matched against: identity values
    /// first, then each property's value (the whole token for unkeyed ones).
    pub fn values(&self) -> impl Iterator<Item = &str> {
        [
            self.name.as_str(),
            self.service_type.as_str(),
            self.domain.as_str(),
        ]
        .into_iter()
        .chain(self.properties.iter().map(|entry| match entry.split_once('=') {
            Some((_, value)) => value,
            None => entry.as_str(),
        }))
    }

    /// Capability bitmask from the `flags` property, if present and numeric.
    pub fn flags(&self) -> Option<Flags> {
        self.get(FLAGS_KEY)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .map(Flags::from_bits)
    }

    /// Location from the `location` property, if present and well formed.
    pub fn location(&self) -> Option<Position> {
        self.get(LOCATION_KEY).and_then(Position::parse)
    }

    fn lookup(&self) -> &HashMap<String, String> {
        self.lookup.get_or_init(|| {
            self.properties
                .iter()
                .map(|entry| {
                    let (key, value) = split_property(entry);
                    (key.to_string(), value.to_string())
                })
                .collect()
        })
    }
}

impl PartialEq for ServiceConfiguration {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.service_type == other.service_type
            && self.domain == other.domain
            && self.interface == other.interface
            && self.protocol == other.protocol
            && self.port == other.port
            && self.properties == other.properties
    }
}

impl Eq for ServiceConfiguration {}
