//! The record repository: the authoritative model of the services published
//! on one interface, the DNS records derived from them, and the reactive
//! computation of replies, probe/announcement payloads and conflicts.
//!
//! The repository is strictly synchronous and I/O-free. It owns one
//! generated host identity (`<host-label>.local`) plus the general records
//! for the interface addresses, and one registration per service.

use core::fmt::{self, Display};
use core::net::{IpAddr, SocketAddr};

use std::collections::{HashMap, HashSet};

use domain::base::iana::Rtype;
use domain::base::ToName;

use log::debug;

use crate::name::{self, DnsName};
use crate::record::{
    DnsPacket, DnsQuestion, DnsRecord, Rdata, RecordInfo, HOST_RECORD_TTL_MS,
    SERVICE_RECORD_TTL_MS,
};
use crate::service::ServiceInfo;
use crate::{
    AdvertiserConfig, MdnsError, ServiceId, MDNS_IPV4_GROUP, MDNS_IPV6_GROUP, MDNS_PORT,
};

/// Errors surfaced synchronously by repository mutations.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RepositoryError {
    /// The service id is already registered.
    DuplicateId,
    /// An active (non-exiting) service already owns the instance name.
    NameConflict,
    /// The service id is not registered.
    UnknownId,
    /// A DNS name could not be built from the registration.
    Name(MdnsError),
}

impl Display for RepositoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateId => write!(f, "Service id already registered"),
            Self::NameConflict => write!(f, "Instance name owned by an active service"),
            Self::UnknownId => write!(f, "Unknown service id"),
            Self::Name(err) => write!(f, "Invalid name in registration: {}", err),
        }
    }
}

impl std::error::Error for RepositoryError {}

impl From<MdnsError> for RepositoryError {
    fn from(err: MdnsError) -> Self {
        Self::Name(err)
    }
}

/// The probe payload for one service: the `ANY` question(s) plus the
/// tentative records in the authority section.
#[derive(Debug, Clone)]
pub struct ProbingInfo {
    pub service_id: ServiceId,
    pub packet: DnsPacket,
}

/// An announcement (or goodbye) payload for one service.
#[derive(Debug, Clone)]
pub struct AnnouncementInfo {
    pub service_id: ServiceId,
    pub packet: DnsPacket,
}

/// A computed reply to an incoming query.
#[derive(Debug, Clone)]
pub struct Reply {
    pub destination: SocketAddr,
    pub packet: DnsPacket,
}

/// All records a single service owns, in the order they are published:
/// type PTR, subtype PTRs, SRV, TXT, service type enumeration PTR.
#[derive(Debug)]
struct ServiceRegistration {
    info: ServiceInfo,
    records: Vec<RecordInfo>,
    exiting: bool,
}

impl ServiceRegistration {
    fn new(id: ServiceId, info: ServiceInfo, host: &DnsName) -> Result<Self, MdnsError> {
        let instance = info.instance_dns_name()?;
        let ty = info.type_dns_name()?;

        let mut records = Vec::with_capacity(info.subtypes().len() + 4);

        records.push(RecordInfo {
            record: DnsRecord::new(
                ty.clone(),
                SERVICE_RECORD_TTL_MS,
                false,
                Rdata::Ptr(instance.clone()),
            ),
            service_id: Some(id),
            is_shared_name: true,
            is_probing: true,
        });

        for subtype in info.subtypes() {
            records.push(RecordInfo {
                record: DnsRecord::new(
                    info.subtype_dns_name(subtype)?,
                    SERVICE_RECORD_TTL_MS,
                    false,
                    Rdata::Ptr(instance.clone()),
                ),
                service_id: Some(id),
                is_shared_name: true,
                is_probing: true,
            });
        }

        records.push(RecordInfo {
            record: DnsRecord::new(
                instance.clone(),
                HOST_RECORD_TTL_MS,
                true,
                Rdata::Srv {
                    priority: info.priority(),
                    weight: info.weight(),
                    port: info.port(),
                    target: host.clone(),
                },
            ),
            service_id: Some(id),
            is_shared_name: false,
            is_probing: true,
        });

        records.push(RecordInfo {
            record: DnsRecord::new(
                instance,
                SERVICE_RECORD_TTL_MS,
                true,
                Rdata::Txt(info.txt_rdata()),
            ),
            service_id: Some(id),
            is_shared_name: false,
            is_probing: true,
        });

        records.push(RecordInfo {
            record: DnsRecord::new(
                name::dns_sd_name()?,
                SERVICE_RECORD_TTL_MS,
                false,
                Rdata::Ptr(ty),
            ),
            service_id: Some(id),
            is_shared_name: true,
            is_probing: true,
        });

        Ok(Self {
            info,
            records,
            exiting: false,
        })
    }

    fn is_probing(&self) -> bool {
        self.records.iter().any(|record| record.is_probing)
    }

    fn set_probing(&mut self, probing: bool) {
        for record in &mut self.records {
            record.is_probing = probing;
        }
    }

    fn srv(&self) -> Option<&RecordInfo> {
        self.records
            .iter()
            .find(|record| record.record.rtype() == Rtype::SRV)
    }

    fn txt(&self) -> Option<&RecordInfo> {
        self.records
            .iter()
            .find(|record| record.record.rtype() == Rtype::TXT)
    }

    /// The PTR records pointing at the instance: the type PTR and the
    /// subtype PTRs, but not the enumeration PTR.
    fn instance_ptrs(&self) -> impl Iterator<Item = &RecordInfo> {
        let instance = self.info.instance_dns_name().ok();

        self.records.iter().filter(move |record| {
            matches!(&record.record.data, Rdata::Ptr(target)
                if instance.as_ref().is_some_and(|name| target.name_eq(name)))
        })
    }
}

/// The per-interface record repository.
pub struct RecordRepository {
    config: AdvertiserConfig,
    host_label: String,
    host_name: DnsName,
    addresses: Vec<IpAddr>,
    /// Reverse-DNS PTRs followed by the host address records.
    general_records: Vec<RecordInfo>,
    services: HashMap<ServiceId, ServiceRegistration>,
    /// Service ids in registration order, the answer ordering rule.
    service_order: Vec<ServiceId>,
}

impl RecordRepository {
    /// Creates a repository with a freshly generated host identity.
    ///
    /// The entropy callback seeds the unique host label, which stays stable
    /// for the lifetime of the repository.
    pub fn new(config: AdvertiserConfig, rand: fn(&mut [u8])) -> Result<Self, MdnsError> {
        let mut seed = [0; 8];
        rand(&mut seed);

        let mut host_label = String::from("Host-");
        for byte in seed {
            host_label.push_str(&format!("{:02X}", byte));
        }

        let host_name = name::host_name(&host_label)?;

        Ok(Self {
            config,
            host_label,
            host_name,
            addresses: Vec::new(),
            general_records: Vec::new(),
            services: HashMap::new(),
            service_order: Vec::new(),
        })
    }

    pub fn host_label(&self) -> &str {
        &self.host_label
    }

    pub fn host_name(&self) -> &DnsName {
        &self.host_name
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn has_services(&self) -> bool {
        !self.services.is_empty()
    }

    pub fn has_active_service(&self, id: ServiceId) -> bool {
        self.services
            .get(&id)
            .is_some_and(|registration| !registration.exiting)
    }

    pub fn is_probing(&self, id: ServiceId) -> bool {
        self.services
            .get(&id)
            .is_some_and(ServiceRegistration::is_probing)
    }

    pub fn service_info(&self, id: ServiceId) -> Option<&ServiceInfo> {
        self.services.get(&id).map(|registration| &registration.info)
    }

    /// Replaces the general records from a new interface address list.
    ///
    /// For every address this publishes one reverse-DNS PTR to the host name
    /// and one A/AAAA record on the host name, all with the cache-flush bit.
    pub fn update_addresses(&mut self, addresses: &[IpAddr]) -> Result<(), MdnsError> {
        let mut records = Vec::with_capacity(addresses.len() * 2);

        for addr in addresses {
            records.push(RecordInfo {
                record: DnsRecord::new(
                    name::reverse_dns_name(*addr)?,
                    HOST_RECORD_TTL_MS,
                    true,
                    Rdata::Ptr(self.host_name.clone()),
                ),
                service_id: None,
                is_shared_name: false,
                is_probing: false,
            });
        }

        for addr in addresses {
            let data = match addr {
                IpAddr::V4(v4) => Rdata::A(*v4),
                IpAddr::V6(v6) => Rdata::Aaaa(*v6),
            };

            records.push(RecordInfo {
                record: DnsRecord::new(self.host_name.clone(), HOST_RECORD_TTL_MS, true, data),
                service_id: None,
                is_shared_name: false,
                is_probing: false,
            });
        }

        self.addresses = addresses.to_vec();
        self.general_records = records;

        Ok(())
    }

    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// Registers a service. The new service starts in the probing state.
    ///
    /// If an *exiting* service holds the same instance name it is displaced
    /// and its id returned, so the caller can cancel its goodbye.
    pub fn add_service(
        &mut self,
        id: ServiceId,
        info: ServiceInfo,
    ) -> Result<Option<ServiceId>, RepositoryError> {
        if self.services.contains_key(&id) {
            return Err(RepositoryError::DuplicateId);
        }

        let mut displaced = None;
        for (other_id, other) in &self.services {
            if !other.info.same_instance_name(info.instance_name()) {
                continue;
            }

            if other.exiting {
                displaced = Some(*other_id);
            } else {
                return Err(RepositoryError::NameConflict);
            }
        }

        if let Some(displaced) = displaced {
            self.purge(displaced);
        }

        let registration = ServiceRegistration::new(id, info, &self.host_name)?;
        self.services.insert(id, registration);
        self.service_order.push(id);

        Ok(displaced)
    }

    /// Replaces the subtype PTR set of an active service.
    pub fn update_service(
        &mut self,
        id: ServiceId,
        subtypes: Vec<String>,
    ) -> Result<(), RepositoryError> {
        let registration = match self.services.get(&id) {
            Some(registration) if !registration.exiting => registration,
            _ => return Err(RepositoryError::UnknownId),
        };

        let probing = registration.is_probing();
        let info = registration
            .info
            .clone()
            .with_subtypes(subtypes)
            .map_err(|_| RepositoryError::Name(MdnsError::InvalidName))?;

        let mut replacement = ServiceRegistration::new(id, info, &self.host_name)?;
        replacement.set_probing(probing);

        self.services.insert(id, replacement);

        Ok(())
    }

    /// Re-registers a service under a new instance name after a conflict.
    /// The service restarts in the probing state.
    pub fn rename_service(
        &mut self,
        id: ServiceId,
        info: ServiceInfo,
    ) -> Result<(), RepositoryError> {
        if !self.services.contains_key(&id) {
            return Err(RepositoryError::UnknownId);
        }

        for (other_id, other) in &self.services {
            if *other_id != id
                && !other.exiting
                && other.info.same_instance_name(info.instance_name())
            {
                return Err(RepositoryError::NameConflict);
            }
        }

        let registration = ServiceRegistration::new(id, info, &self.host_name)?;
        self.services.insert(id, registration);

        Ok(())
    }

    /// Marks all records of the service as probing and returns the probe
    /// payload: the `ANY` question for the instance name plus the tentative
    /// SRV in the authority section (and the host question and address
    /// records, when address probing is configured).
    pub fn set_service_probing(&mut self, id: ServiceId) -> Result<ProbingInfo, RepositoryError> {
        let include_addresses = self.config.address_records_in_probing;
        let host_name = self.host_name.clone();
        let address_records: Vec<DnsRecord> = self
            .general_records
            .iter()
            .filter(|record| !matches!(record.record.data, Rdata::Ptr(_)))
            .map(|record| record.record.clone())
            .collect();

        let registration = self
            .services
            .get_mut(&id)
            .ok_or(RepositoryError::UnknownId)?;

        registration.set_probing(true);

        let instance = registration
            .info
            .instance_dns_name()
            .map_err(RepositoryError::Name)?;

        let mut packet = DnsPacket::query();
        packet.questions.push(DnsQuestion {
            name: instance,
            rtype: Rtype::ANY,
            unicast_response: true,
        });

        if let Some(srv) = registration.srv() {
            packet.authority.push(srv.record.clone());
        }

        if include_addresses && !address_records.is_empty() {
            packet.questions.push(DnsQuestion {
                name: host_name,
                rtype: Rtype::ANY,
                unicast_response: true,
            });
            packet.authority.extend(address_records);
        }

        Ok(ProbingInfo {
            service_id: id,
            packet,
        })
    }

    /// Clears the probing state of a service whose probe sequence completed
    /// without a conflict, and builds its announcement.
    pub fn on_probing_succeeded(
        &mut self,
        id: ServiceId,
    ) -> Result<AnnouncementInfo, RepositoryError> {
        let registration = self
            .services
            .get_mut(&id)
            .ok_or(RepositoryError::UnknownId)?;

        registration.set_probing(false);

        self.announcement_info(id)
    }

    /// The announcement of one published service: the general records
    /// followed by the service records as answers, plus one NSEC per
    /// published unique name in the additional section.
    pub fn announcement_info(&self, id: ServiceId) -> Result<AnnouncementInfo, RepositoryError> {
        let registration = self.services.get(&id).ok_or(RepositoryError::UnknownId)?;

        let mut packet = DnsPacket::response();

        for record in &self.general_records {
            packet.answers.push(record.record.clone());
        }

        for record in &registration.records {
            packet.answers.push(record.record.clone());
        }

        let unique: Vec<&DnsRecord> = self
            .general_records
            .iter()
            .chain(registration.records.iter())
            .filter(|record| !record.is_shared_name)
            .map(|record| &record.record)
            .collect();

        packet.additional = nsec_records(&unique);

        Ok(AnnouncementInfo {
            service_id: id,
            packet,
        })
    }

    /// Marks the service as exiting and returns its goodbye.
    ///
    /// Returns `None` if the service is unknown or already exiting.
    pub fn exit_service(&mut self, id: ServiceId) -> Option<AnnouncementInfo> {
        let registration = self.services.get_mut(&id)?;
        if registration.exiting {
            return None;
        }

        registration.exiting = true;

        self.goodbye_info(id)
    }

    /// The goodbye of a service: its instance PTR records (type and
    /// subtypes) with TTL 0.
    pub fn goodbye_info(&self, id: ServiceId) -> Option<AnnouncementInfo> {
        let registration = self.services.get(&id)?;

        let mut packet = DnsPacket::response();
        for record in registration.instance_ptrs() {
            let mut goodbye = record.record.clone();
            goodbye.ttl_ms = 0;
            packet.answers.push(goodbye);
        }

        Some(AnnouncementInfo {
            service_id: id,
            packet,
        })
    }

    /// Destroys a service record set without a goodbye.
    pub fn remove_service(&mut self, id: ServiceId) {
        self.purge(id);
    }

    /// Removes every service and returns the purged ids.
    pub fn clear_services(&mut self) -> Vec<ServiceId> {
        let ids = core::mem::take(&mut self.service_order);
        self.services.clear();
        ids
    }

    /// A prebuilt announcement of one service that an offload engine can
    /// replay verbatim: the service records plus the host records, no NSEC.
    pub fn get_offload_packet(&self, id: ServiceId) -> Result<DnsPacket, RepositoryError> {
        let registration = self.services.get(&id).ok_or(RepositoryError::UnknownId)?;

        let mut packet = DnsPacket::response();

        for record in registration
            .instance_ptrs()
            .chain(registration.srv())
            .chain(registration.txt())
        {
            packet.answers.push(record.record.clone());
        }

        for record in &self.general_records {
            packet.answers.push(record.record.clone());
        }

        Ok(packet)
    }

    /// The reverse-DNS name of an address.
    pub fn get_reverse_dns_address(&self, addr: IpAddr) -> Result<DnsName, MdnsError> {
        name::reverse_dns_name(addr)
    }

    /// Computes the reply to an incoming query, if any.
    ///
    /// Questions match records by case-insensitive name and exact or `ANY`
    /// type; records of probing and exiting services never answer. The reply
    /// is unicast to `src` only if every answered question requested a
    /// unicast response, and multicast to the group of `src`'s address
    /// family otherwise.
    pub fn get_reply(&self, incoming: &DnsPacket, src: SocketAddr) -> Option<Reply> {
        if incoming.is_response() {
            return None;
        }

        let records = self.answerable_records();

        let mut answer_indexes = Vec::new();
        let mut answered = HashSet::new();
        let mut unicast = true;

        for question in &incoming.questions {
            let mut matched = false;

            for (index, record) in records.iter().enumerate() {
                if !record.record.answers(&question.name, question.rtype) {
                    continue;
                }

                matched = true;

                if self.config.known_answer_suppression
                    && is_known_answer(&record.record, &incoming.answers)
                {
                    debug!(
                        "Suppressing known answer for [{}]",
                        record.record.name
                    );
                    continue;
                }

                if answered.insert(index) {
                    answer_indexes.push(index);
                }
            }

            if matched {
                unicast &= question.unicast_response;
            }
        }

        if answer_indexes.is_empty() {
            return None;
        }

        // Complete the reply: an answered instance PTR pulls in the SRV,
        // TXT and address records, an answered SRV pulls in the addresses.
        let mut additional_indexes = Vec::new();
        let mut included = answered.clone();

        for index in &answer_indexes {
            let record = records[*index];

            match &record.record.data {
                Rdata::Ptr(target) => {
                    if let Some(id) = record.service_id {
                        if self.is_instance_name(id, target) {
                            self.push_service_additionals(
                                id,
                                &records,
                                &mut included,
                                &mut additional_indexes,
                            );
                        }
                    }
                }
                Rdata::Srv { .. } => {
                    self.push_address_additionals(&records, &mut included, &mut additional_indexes);
                }
                _ => (),
            }
        }

        let mut packet = DnsPacket::response();
        for index in &answer_indexes {
            packet.answers.push(records[*index].record.clone());
        }
        for index in &additional_indexes {
            packet.additional.push(records[*index].record.clone());
        }

        let unique: Vec<&DnsRecord> = answer_indexes
            .iter()
            .chain(additional_indexes.iter())
            .map(|index| records[*index])
            .filter(|record| !record.is_shared_name)
            .map(|record| &record.record)
            .collect();

        packet.additional.extend(nsec_records(&unique));

        let destination = if unicast {
            src
        } else {
            match src {
                SocketAddr::V4(_) => SocketAddr::from((MDNS_IPV4_GROUP, MDNS_PORT)),
                SocketAddr::V6(_) => SocketAddr::from((MDNS_IPV6_GROUP, MDNS_PORT)),
            }
        };

        Some(Reply {
            destination,
            packet,
        })
    }

    /// The ids of services whose unique records a peer contradicts.
    ///
    /// An incoming answer conflicts if it claims a name we own uniquely with
    /// anything but an exact copy of one of our records there. Goodbye
    /// records (TTL 0) and exact mirrors (our own traffic looped back) do
    /// not conflict.
    pub fn get_conflicting_services(&self, incoming: &DnsPacket) -> HashSet<ServiceId> {
        let mut conflicts = HashSet::new();

        for answer in &incoming.answers {
            if answer.ttl_ms == 0 {
                continue;
            }

            let ours: Vec<&RecordInfo> = self
                .iter_records()
                .filter(|record| {
                    !record.is_shared_name
                        && !self.is_exiting(record.service_id)
                        && record.record.name.name_eq(&answer.name)
                })
                .collect();

            if ours.is_empty() {
                continue;
            }

            let mirrored = ours.iter().any(|record| {
                record.record.rtype() == answer.rtype() && record.record.data == answer.data
            });

            if mirrored {
                continue;
            }

            conflicts.extend(ours.iter().filter_map(|record| record.service_id));
        }

        conflicts
    }

    fn purge(&mut self, id: ServiceId) {
        self.services.remove(&id);
        self.service_order.retain(|other| *other != id);
    }

    fn is_exiting(&self, id: Option<ServiceId>) -> bool {
        id.and_then(|id| self.services.get(&id))
            .is_some_and(|registration| registration.exiting)
    }

    fn is_instance_name(&self, id: ServiceId, target: &DnsName) -> bool {
        self.services
            .get(&id)
            .and_then(|registration| registration.info.instance_dns_name().ok())
            .is_some_and(|instance| instance.name_eq(target))
    }

    /// All records in publication order: general records first, then the
    /// services in registration order.
    fn iter_records(&self) -> impl Iterator<Item = &RecordInfo> {
        self.general_records.iter().chain(
            self.service_order
                .iter()
                .filter_map(|id| self.services.get(id))
                .flat_map(|registration| registration.records.iter()),
        )
    }

    /// The records eligible to answer queries: everything except records of
    /// probing or exiting services.
    fn answerable_records(&self) -> Vec<&RecordInfo> {
        self.general_records
            .iter()
            .chain(
                self.service_order
                    .iter()
                    .filter_map(|id| self.services.get(id))
                    .filter(|registration| !registration.is_probing() && !registration.exiting)
                    .flat_map(|registration| registration.records.iter()),
            )
            .collect()
    }

    fn push_service_additionals(
        &self,
        id: ServiceId,
        records: &[&RecordInfo],
        included: &mut HashSet<usize>,
        additional_indexes: &mut Vec<usize>,
    ) {
        for (index, record) in records.iter().enumerate() {
            let relevant = record.service_id == Some(id)
                && matches!(record.record.data, Rdata::Srv { .. } | Rdata::Txt(_));

            if relevant && included.insert(index) {
                additional_indexes.push(index);
            }
        }

        self.push_address_additionals(records, included, additional_indexes);
    }

    fn push_address_additionals(
        &self,
        records: &[&RecordInfo],
        included: &mut HashSet<usize>,
        additional_indexes: &mut Vec<usize>,
    ) {
        for (index, record) in records.iter().enumerate() {
            let relevant = record.service_id.is_none()
                && matches!(record.record.data, Rdata::A(_) | Rdata::Aaaa(_));

            if relevant && included.insert(index) {
                additional_indexes.push(index);
            }
        }
    }
}

/// Whether the query's answer section already carries this record with at
/// least half of our TTL left (RFC 6762 §7.1).
///
/// The peer TTL arrives in whole seconds; ours is halved in milliseconds
/// with the sub-second remainder truncated.
fn is_known_answer(record: &DnsRecord, known: &[DnsRecord]) -> bool {
    known.iter().any(|answer| {
        answer.rtype() == record.rtype()
            && answer.name.name_eq(&record.name)
            && answer.ttl_ms >= record.ttl_ms / 2
    })
}

/// Builds one NSEC per unique name: `next_domain` is the name itself, the
/// TTL the minimum of the group, and the type bitmap the exact set of types
/// published at that name. Original name case is preserved from the first
/// record of each group.
fn nsec_records(unique: &[&DnsRecord]) -> Vec<DnsRecord> {
    let mut groups: Vec<(DnsName, u64, Vec<Rtype>)> = Vec::new();
    let mut by_name: HashMap<DnsName, usize> = HashMap::new();

    for record in unique {
        let index = *by_name
            .entry(record.name.clone())
            .or_insert_with(|| {
                groups.push((record.name.clone(), record.ttl_ms, Vec::new()));
                groups.len() - 1
            });

        let (_, ttl_ms, types) = &mut groups[index];
        *ttl_ms = (*ttl_ms).min(record.ttl_ms);
        if !types.contains(&record.rtype()) {
            types.push(record.rtype());
        }
    }

    groups
        .into_iter()
        .map(|(name, ttl_ms, types)| {
            DnsRecord::new(
                name.clone(),
                ttl_ms,
                true,
                Rdata::Nsec {
                    next_domain: name,
                    types,
                },
            )
        })
        .collect()
}
