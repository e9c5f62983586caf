#![warn(clippy::large_futures)]
#![allow(async_fn_in_trait)]

//! An mDNS/DNS-SD service advertiser and responder (RFC 6762 / RFC 6763).
//!
//! Given a set of service registrations, each bound to one or more network
//! interfaces, the crate probes the chosen instance names for uniqueness on
//! the local link, announces the services, answers queries from peers
//! (including negative NSEC answers and known-answer suppression), resolves
//! name conflicts and withdraws services with TTL=0 goodbye announcements.
//!
//! The crate splits into a synchronous, I/O-free core and an async `io`
//! layer (enabled by the default `io` feature):
//! - [`repository`] owns the services and their records and computes
//!   replies, probe/announcement payloads and conflicts,
//! - [`repeater`] schedules the timed probe and announcement retransmissions,
//! - [`advertiser`] drives the per-interface service state machines,
//! - [`manager`] aggregates one advertiser per interface and handles
//!   conflict renaming,
//! - [`io`] binds everything to UDP sockets, timers and the multinetwork
//!   fan-out.
//!
//! The core never reads the clock or touches a socket. The io layer samples
//! the current time and passes it in, so every scheduling decision is
//! deterministic and unit-testable.

use core::fmt::{self, Display};
use core::net::{Ipv4Addr, Ipv6Addr};

use domain::base::message::ShortMessage;
use domain::base::message_builder::PushError;
use domain::base::name::FromStrError;
use domain::base::wire::ParseError;
use domain::dep::octseq::ShortBuf;

use embassy_time::Duration;

pub mod advertiser;
#[cfg(feature = "io")]
pub mod io;
pub mod manager;
pub mod name;
pub mod record;
pub mod repeater;
pub mod repository;
pub mod service;

/// Re-export the domain lib if the user would like to directly
/// assemble / parse mDNS messages.
pub mod domain {
    pub use domain::*;
}

/// The IPv4 mDNS multicast group, as per spec.
pub const MDNS_IPV4_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);

/// The IPv6 mDNS multicast group, as per spec.
pub const MDNS_IPV6_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x00fb);

/// The mDNS port, as per spec.
pub const MDNS_PORT: u16 = 5353;

/// Identifier of a registered service, unique within one repository.
pub type ServiceId = u64;

/// Opaque caller-supplied identity for listeners and interface keys.
pub type Token = u64;

/// A wrapper type for the errors returned by the `domain` library during
/// parsing and constructing mDNS messages, plus name validation failures.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MdnsError {
    ShortBuf,
    InvalidMessage,
    InvalidName,
}

impl Display for MdnsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortBuf => write!(f, "ShortBuf"),
            Self::InvalidMessage => write!(f, "InvalidMessage"),
            Self::InvalidName => write!(f, "InvalidName"),
        }
    }
}

impl std::error::Error for MdnsError {}

impl From<ShortBuf> for MdnsError {
    fn from(_: ShortBuf) -> Self {
        Self::ShortBuf
    }
}

impl From<PushError> for MdnsError {
    fn from(_: PushError) -> Self {
        Self::ShortBuf
    }
}

impl From<FromStrError> for MdnsError {
    fn from(_: FromStrError) -> Self {
        Self::InvalidName
    }
}

impl From<ShortMessage> for MdnsError {
    fn from(_: ShortMessage) -> Self {
        Self::InvalidMessage
    }
}

impl From<ParseError> for MdnsError {
    fn from(_: ParseError) -> Self {
        Self::InvalidMessage
    }
}

/// Runtime-static configuration for the advertiser stack.
///
/// The defaults implement the RFC 6762 probing (§8.1) and announcing (§8.3)
/// timings; the numeric knobs exist for tests and for products that need a
/// different aggressiveness on constrained links.
#[derive(Debug, Clone)]
pub struct AdvertiserConfig {
    /// Honor the known-answer sections of incoming queries and suppress
    /// answers the querier demonstrably still holds.
    pub known_answer_suppression: bool,
    /// Include the host address records as tentative authority records
    /// (and the host name question) while probing.
    pub address_records_in_probing: bool,
    /// Number of probe queries sent before a name is considered won.
    pub probe_count: usize,
    /// Interval between probe queries. The first probe is delayed by a
    /// random fraction of this interval.
    pub probe_interval: Duration,
    /// Number of unsolicited announcements after probing succeeds.
    pub announce_count: usize,
    /// Interval before the second announcement; doubles after every shot.
    pub announce_initial_interval: Duration,
    /// Delay before a TTL=0 goodbye is sent, so that several services
    /// removed together coalesce their exits.
    pub exit_announcement_delay: Duration,
}

impl AdvertiserConfig {
    pub const fn new() -> Self {
        Self {
            known_answer_suppression: true,
            address_records_in_probing: false,
            probe_count: 3,
            probe_interval: Duration::from_millis(250),
            announce_count: 8,
            announce_initial_interval: Duration::from_millis(1000),
            exit_announcement_delay: Duration::from_millis(100),
        }
    }
}

impl Default for AdvertiserConfig {
    fn default() -> Self {
        Self::new()
    }
}
