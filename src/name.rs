//! Construction helpers for the DNS names the advertiser publishes.
//!
//! All names are owned `domain` names over `Vec<u8>`. Name equality, ordering
//! and hashing in the `domain` lib are ASCII-case-insensitive, which is
//! exactly the mDNS matching rule, so these names can be used directly as map
//! keys without a separate case-folding step.

use core::net::IpAddr;

use domain::base::name::{Name, NameBuilder};

use crate::MdnsError;

/// The owned name type used throughout the crate.
pub type DnsName = Name<Vec<u8>>;

/// Labels of the DNS-SD service type enumeration owner,
/// `_services._dns-sd._udp.local`.
pub const DNS_SD_LABELS: &[&str] = &["_services", "_dns-sd", "_udp", "local"];

/// The `.local` TLD appended to every name the advertiser owns.
pub const LOCAL_TLD: &str = "local";

/// Builds an absolute name from a sequence of string labels.
pub fn from_labels<'a, I>(labels: I) -> Result<DnsName, MdnsError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut builder = NameBuilder::new_vec();

    for label in labels {
        builder
            .append_label(label.as_bytes())
            .map_err(|_| MdnsError::InvalidName)?;
    }

    builder.into_name().map_err(|_| MdnsError::InvalidName)
}

/// The name of the service type enumeration record, `_services._dns-sd._udp.local`.
pub fn dns_sd_name() -> Result<DnsName, MdnsError> {
    from_labels(DNS_SD_LABELS.iter().copied())
}

/// `<host-label>.local`.
pub fn host_name(host_label: &str) -> Result<DnsName, MdnsError> {
    from_labels([host_label, LOCAL_TLD])
}

/// `<type-labels>.local`, e.g. `_testservice._tcp.local`.
pub fn service_type_name(type_labels: &[String]) -> Result<DnsName, MdnsError> {
    from_labels(
        type_labels
            .iter()
            .map(String::as_str)
            .chain([LOCAL_TLD]),
    )
}

/// `<instance>.<type-labels>.local`.
pub fn instance_name(instance: &str, type_labels: &[String]) -> Result<DnsName, MdnsError> {
    from_labels(
        [instance]
            .into_iter()
            .chain(type_labels.iter().map(String::as_str))
            .chain([LOCAL_TLD]),
    )
}

/// `<subtype>._sub.<type-labels>.local`.
pub fn subtype_name(subtype: &str, type_labels: &[String]) -> Result<DnsName, MdnsError> {
    from_labels(
        [subtype, "_sub"]
            .into_iter()
            .chain(type_labels.iter().map(String::as_str))
            .chain([LOCAL_TLD]),
    )
}

/// The reverse-DNS name of an address: `d.c.b.a.in-addr.arpa` for IPv4
/// `a.b.c.d`, and the 32 reversed nibbles under `ip6.arpa` for IPv6.
pub fn reverse_dns_name(addr: IpAddr) -> Result<DnsName, MdnsError> {
    Name::<Vec<u8>>::reverse_from_addr(addr).map_err(|_| MdnsError::InvalidName)
}
