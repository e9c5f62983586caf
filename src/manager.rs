//! The advertiser manager: one [`InterfaceAdvertiser`] per interface socket,
//! a shared view of the registered services, and the conflict rename policy.
//!
//! The manager is the owner-facing aggregation point: registration success
//! is reported once (for the first interface whose probe succeeds), and a
//! name conflict on any interface renames the service everywhere and
//! restarts its probing.

use core::net::{IpAddr, SocketAddr};

use std::collections::{HashMap, HashSet};

use embassy_time::Instant;

use log::{info, warn};

use crate::advertiser::{AdvertiserCallback, InterfaceAdvertiser, OutgoingPacket};
use crate::record::DnsPacket;
use crate::repository::RepositoryError;
use crate::service::ServiceInfo;
use crate::{AdvertiserConfig, ServiceId, Token};

/// Aggregated notifications of the whole advertiser set.
pub trait ManagerCallback {
    /// The service won its name on the first interface; it is now being
    /// announced. Reported once per registration.
    fn on_register_service_succeeded(&mut self, service_id: ServiceId);

    /// A conflict forced a new instance name; probing restarts everywhere
    /// under the new name.
    fn on_service_renamed(&mut self, service_id: ServiceId, instance_name: &str);
}

/// One packet to send, tagged with the interface it belongs to.
pub type InterfacePacket = (Token, OutgoingPacket);

#[derive(Default)]
struct Collected {
    succeeded: Vec<ServiceId>,
    conflicts: Vec<(ServiceId, bool)>,
}

impl AdvertiserCallback for Collected {
    fn on_register_service_succeeded(&mut self, service_id: ServiceId) {
        self.succeeded.push(service_id);
    }

    fn on_service_conflict(&mut self, service_id: ServiceId, during_probing: bool) {
        self.conflicts.push((service_id, during_probing));
    }

    fn on_all_services_removed(&mut self) {}
}

/// The per-service set of interface advertisers.
pub struct AdvertiserManager {
    config: AdvertiserConfig,
    rand: fn(&mut [u8]),
    advertisers: HashMap<Token, InterfaceAdvertiser>,
    services: HashMap<ServiceId, ServiceInfo>,
    succeeded: HashSet<ServiceId>,
}

impl AdvertiserManager {
    pub fn new(config: AdvertiserConfig, rand: fn(&mut [u8])) -> Self {
        Self {
            config,
            rand,
            advertisers: HashMap::new(),
            services: HashMap::new(),
            succeeded: HashSet::new(),
        }
    }

    pub fn interface_count(&self) -> usize {
        self.advertisers.len()
    }

    pub fn service_info(&self, id: ServiceId) -> Option<&ServiceInfo> {
        self.services.get(&id)
    }

    pub fn advertiser(&self, interface: Token) -> Option<&InterfaceAdvertiser> {
        self.advertisers.get(&interface)
    }

    /// Brings a new interface under management. Every registered service
    /// starts probing on it right away.
    pub fn add_interface(
        &mut self,
        interface: Token,
        addresses: &[IpAddr],
        now: Instant,
    ) -> Result<(), RepositoryError> {
        if self.advertisers.contains_key(&interface) {
            return Err(RepositoryError::DuplicateId);
        }

        let mut advertiser = InterfaceAdvertiser::new(self.config.clone(), self.rand)?;
        advertiser.update_addresses(addresses)?;

        for (id, info) in &self.services {
            if let Err(err) = advertiser.add_service(*id, info.clone(), now) {
                warn!("Cannot advertise service {id} on new interface: {err}");
            }
        }

        self.advertisers.insert(interface, advertiser);

        Ok(())
    }

    /// Tears an interface down, returning the goodbye packets that should
    /// still go out on it before its socket closes.
    pub fn remove_interface(&mut self, interface: Token) -> Vec<OutgoingPacket> {
        match self.advertisers.remove(&interface) {
            Some(mut advertiser) => advertiser.destroy(),
            None => Vec::new(),
        }
    }

    /// Replaces the address set of one interface and re-announces the
    /// published services with the new address records.
    pub fn update_interface_addresses(
        &mut self,
        interface: Token,
        addresses: &[IpAddr],
        now: Instant,
    ) -> Result<(), RepositoryError> {
        let advertiser = self
            .advertisers
            .get_mut(&interface)
            .ok_or(RepositoryError::UnknownId)?;

        advertiser.update_addresses(addresses)?;
        advertiser.restart_announcing(now);

        Ok(())
    }

    /// Registers a service on every managed interface.
    pub fn add_service(
        &mut self,
        id: ServiceId,
        info: ServiceInfo,
        now: Instant,
    ) -> Result<(), RepositoryError> {
        if self.services.contains_key(&id) {
            return Err(RepositoryError::DuplicateId);
        }

        if self
            .services
            .values()
            .any(|other| other.same_instance_name(info.instance_name()))
        {
            return Err(RepositoryError::NameConflict);
        }

        for advertiser in self.advertisers.values_mut() {
            if let Err(err) = advertiser.add_service(id, info.clone(), now) {
                warn!("Cannot advertise service {id}: {err}");
            }
        }

        info!(
            "Registered service {id} ({})",
            info.instance_name()
        );
        self.services.insert(id, info);

        Ok(())
    }

    /// Removes a service from every interface; published instances exit
    /// with a goodbye.
    pub fn remove_service(&mut self, id: ServiceId, now: Instant) {
        let mut collected = Collected::default();

        for advertiser in self.advertisers.values_mut() {
            advertiser.remove_service(id, now, &mut collected);
        }

        self.services.remove(&id);
        self.succeeded.remove(&id);
    }

    /// Replaces the subtype set of a service on every interface.
    pub fn update_service(
        &mut self,
        id: ServiceId,
        subtypes: Vec<String>,
    ) -> Result<(), RepositoryError> {
        let info = self
            .services
            .get(&id)
            .ok_or(RepositoryError::UnknownId)?
            .clone()
            .with_subtypes(subtypes.clone())
            .map_err(|_| RepositoryError::Name(crate::MdnsError::InvalidName))?;

        for advertiser in self.advertisers.values_mut() {
            if let Err(err) = advertiser.update_service(id, subtypes.clone()) {
                warn!("Cannot update service {id}: {err}");
            }
        }

        self.services.insert(id, info);

        Ok(())
    }

    /// The earliest timer deadline across all interfaces.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.advertisers
            .values()
            .filter_map(InterfaceAdvertiser::next_deadline)
            .min()
    }

    /// Drives every interface advertiser and returns the packets to send,
    /// tagged with their interface.
    pub fn advance(
        &mut self,
        now: Instant,
        callback: &mut impl ManagerCallback,
    ) -> Vec<InterfacePacket> {
        let mut collected = Collected::default();
        let mut packets = Vec::new();

        for (interface, advertiser) in &mut self.advertisers {
            for packet in advertiser.advance(now, &mut collected) {
                packets.push((*interface, packet));
            }
        }

        self.process(collected, now, callback);

        packets
    }

    /// Feeds a packet received on one interface into its advertiser.
    pub fn handle_packet(
        &mut self,
        interface: Token,
        incoming: &DnsPacket,
        src: SocketAddr,
        now: Instant,
        callback: &mut impl ManagerCallback,
    ) -> Vec<InterfacePacket> {
        let mut collected = Collected::default();
        let mut packets = Vec::new();

        if let Some(advertiser) = self.advertisers.get_mut(&interface) {
            for packet in advertiser.handle_packet(incoming, src, &mut collected) {
                packets.push((interface, packet));
            }
        }

        self.process(collected, now, callback);

        packets
    }

    fn process(&mut self, collected: Collected, now: Instant, callback: &mut impl ManagerCallback) {
        for id in collected.succeeded {
            if self.succeeded.insert(id) {
                callback.on_register_service_succeeded(id);
            }
        }

        let mut renamed = HashSet::new();
        for (id, _during_probing) in collected.conflicts {
            if !renamed.insert(id) {
                continue;
            }

            self.rename_for_conflict(id, now, callback);
        }
    }

    /// Picks the next free `"Name (n)"` candidate and restarts probing for
    /// the service under it on every interface.
    fn rename_for_conflict(
        &mut self,
        id: ServiceId,
        now: Instant,
        callback: &mut impl ManagerCallback,
    ) {
        let Some(info) = self.services.get(&id) else {
            return;
        };

        let mut candidate = next_instance_name(info.instance_name());
        while self
            .services
            .values()
            .any(|other| other.same_instance_name(&candidate))
        {
            candidate = next_instance_name(&candidate);
        }

        let renamed = match info.renamed(&candidate) {
            Ok(renamed) => renamed,
            Err(err) => {
                warn!("Cannot rename conflicting service {id}: {err}");
                return;
            }
        };

        info!(
            "Renaming conflicting service {id} to \"{candidate}\""
        );

        for advertiser in self.advertisers.values_mut() {
            if let Err(err) = advertiser.rename_service(id, renamed.clone(), now) {
                warn!("Cannot rename service {id} on an interface: {err}");
            }
        }

        self.services.insert(id, renamed);
        callback.on_service_renamed(id, &candidate);
    }
}

/// `"Name"` becomes `"Name (2)"`; an existing counter suffix is bumped, so
/// `"Name (2)"` becomes `"Name (3)"`.
fn next_instance_name(name: &str) -> String {
    if let Some(stripped) = name.strip_suffix(')') {
        if let Some((base, counter)) = stripped.rsplit_once(" (") {
            if let Ok(counter) = counter.parse::<u32>() {
                return format!("{} ({})", base, counter + 1);
            }
        }
    }

    format!("{} (2)", name)
}
