//! The DNS-SD service registration model.

use core::fmt::{self, Display};

use crate::name::{self, DnsName};
use crate::MdnsError;

/// Longest TXT entry (`key=value`) representable in a DNS character string.
const TXT_ENTRY_MAX: usize = 255;

/// Validation errors for service registrations.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ServiceError {
    /// The instance name is empty or does not fit in a DNS label.
    InvalidInstanceName,
    /// The service type is not of the form `_name._tcp` / `_name._udp`
    /// (optionally with `,subtype` suffixes).
    InvalidServiceType,
    /// A subtype label is empty or does not fit in a DNS label.
    InvalidSubtype,
    /// A TXT attribute key is empty, contains `=`, or contains a byte
    /// outside printable ASCII.
    InvalidTxtKey,
    /// A TXT `key=value` entry exceeds 255 bytes.
    TxtEntryTooLong,
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInstanceName => write!(f, "Invalid service instance name"),
            Self::InvalidServiceType => write!(f, "Invalid service type"),
            Self::InvalidSubtype => write!(f, "Invalid service subtype"),
            Self::InvalidTxtKey => write!(f, "Invalid TXT attribute key"),
            Self::TxtEntryTooLong => write!(f, "TXT attribute entry exceeds 255 bytes"),
        }
    }
}

impl std::error::Error for ServiceError {}

/// One DNS-SD TXT attribute: a key with an optional value.
///
/// A `None` value is published as the bare key (no `=`), which DNS-SD
/// distinguishes from an empty value.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TxtAttribute {
    key: String,
    value: Option<Vec<u8>>,
}

impl TxtAttribute {
    pub fn new(key: &str, value: Option<&[u8]>) -> Result<Self, ServiceError> {
        if key.is_empty()
            || !key
                .bytes()
                .all(|b| (0x20..=0x7e).contains(&b) && b != b'=')
        {
            return Err(ServiceError::InvalidTxtKey);
        }

        let value_len = value.map(|v| v.len() + 1).unwrap_or(0);
        if key.len() + value_len > TXT_ENTRY_MAX {
            return Err(ServiceError::TxtEntryTooLong);
        }

        Ok(Self {
            key: key.to_string(),
            value: value.map(<[u8]>::to_vec),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Appends this attribute as one length-prefixed TXT entry.
    fn append_entry(&self, out: &mut Vec<u8>) {
        let len = self.key.len() + self.value.as_ref().map(|v| v.len() + 1).unwrap_or(0);

        out.push(len as u8);
        out.extend_from_slice(self.key.as_bytes());
        if let Some(value) = &self.value {
            out.push(b'=');
            out.extend_from_slice(value);
        }
    }
}

/// A service registration: the caller-visible description from which the
/// repository derives all DNS records.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServiceInfo {
    instance_name: String,
    type_labels: Vec<String>,
    subtypes: Vec<String>,
    port: u16,
    priority: u16,
    weight: u16,
    attributes: Vec<TxtAttribute>,
}

impl ServiceInfo {
    /// Creates a registration from the string form of a service type,
    /// e.g. `"_testservice._tcp"` or `"_testservice._tcp,_sub1,_sub2"`.
    ///
    /// The `.local` TLD is appended when names are built, never supplied here.
    pub fn new(instance_name: &str, service_type: &str, port: u16) -> Result<Self, ServiceError> {
        let (type_labels, subtypes) = parse_service_type(service_type)?;

        if instance_name.is_empty() || instance_name.len() > 63 {
            return Err(ServiceError::InvalidInstanceName);
        }

        Ok(Self {
            instance_name: instance_name.to_string(),
            type_labels,
            subtypes,
            port,
            priority: 0,
            weight: 0,
            attributes: Vec::new(),
        })
    }

    pub fn with_attributes(mut self, attributes: Vec<TxtAttribute>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_subtypes(mut self, subtypes: Vec<String>) -> Result<Self, ServiceError> {
        for subtype in &subtypes {
            validate_label(subtype).map_err(|_| ServiceError::InvalidSubtype)?;
        }

        self.subtypes = subtypes;
        Ok(self)
    }

    pub fn with_srv_parameters(mut self, priority: u16, weight: u16) -> Self {
        self.priority = priority;
        self.weight = weight;
        self
    }

    /// Returns a copy under a different instance name, for conflict renames.
    pub fn renamed(&self, instance_name: &str) -> Result<Self, ServiceError> {
        if instance_name.is_empty() || instance_name.len() > 63 {
            return Err(ServiceError::InvalidInstanceName);
        }

        let mut info = self.clone();
        info.instance_name = instance_name.to_string();
        Ok(info)
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn type_labels(&self) -> &[String] {
        &self.type_labels
    }

    pub fn subtypes(&self) -> &[String] {
        &self.subtypes
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn weight(&self) -> u16 {
        self.weight
    }

    pub fn attributes(&self) -> &[TxtAttribute] {
        &self.attributes
    }

    /// `<instance>.<type>.local`.
    pub fn instance_dns_name(&self) -> Result<DnsName, MdnsError> {
        name::instance_name(&self.instance_name, &self.type_labels)
    }

    /// `<type>.local`.
    pub fn type_dns_name(&self) -> Result<DnsName, MdnsError> {
        name::service_type_name(&self.type_labels)
    }

    /// `<subtype>._sub.<type>.local`.
    pub fn subtype_dns_name(&self, subtype: &str) -> Result<DnsName, MdnsError> {
        name::subtype_name(subtype, &self.type_labels)
    }

    /// The raw TXT rdata: length-prefixed `key=value` entries, or the
    /// mandatory single empty string when no attributes are set.
    pub fn txt_rdata(&self) -> Vec<u8> {
        if self.attributes.is_empty() {
            return vec![0];
        }

        let mut out = Vec::new();
        for attribute in &self.attributes {
            attribute.append_entry(&mut out);
        }

        out
    }

    /// Case-insensitive instance name comparison, the mDNS equality rule.
    pub fn same_instance_name(&self, other: &str) -> bool {
        self.instance_name.eq_ignore_ascii_case(other)
    }
}

fn validate_label(label: &str) -> Result<(), ServiceError> {
    if label.is_empty() || label.len() > 63 {
        return Err(ServiceError::InvalidServiceType);
    }

    Ok(())
}

/// Splits `"_foo._tcp,_sub1,_sub2"` into the type labels and the subtypes.
///
/// The type must contain at least two labels and end in `_tcp` or `_udp`.
pub fn parse_service_type(service_type: &str) -> Result<(Vec<String>, Vec<String>), ServiceError> {
    let mut parts = service_type.split(',');

    let ty = parts.next().unwrap_or_default();
    let type_labels: Vec<String> = ty.split('.').map(str::to_string).collect();

    if type_labels.len() < 2 {
        return Err(ServiceError::InvalidServiceType);
    }

    for label in &type_labels {
        validate_label(label)?;
    }

    let last = type_labels.last().map(String::as_str);
    if last != Some("_tcp") && last != Some("_udp") {
        return Err(ServiceError::InvalidServiceType);
    }

    let mut subtypes = Vec::new();
    for subtype in parts {
        validate_label(subtype).map_err(|_| ServiceError::InvalidSubtype)?;
        subtypes.push(subtype.to_string());
    }

    Ok((type_labels, subtypes))
}
