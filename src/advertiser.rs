//! The per-interface advertiser: one state machine per (socket, repository)
//! pair, orchestrating the prober, the announcer and the record repository.
//!
//! Per-service lifecycle:
//!
//! ```text
//!   add_service            probe success
//! ∅ ───────────▶ PROBING ───────────────▶ ANNOUNCING ──▶ ACTIVE
//!                   ▲                          │            │
//!                   │ rename (conflict)        │ conflict   │ remove / exit
//!                   └──────────────────────────┴────────────┤
//!                                                           ▼
//!                                                        EXITING ──▶ gone
//! ```
//!
//! Like the repository, the advertiser is I/O-free: incoming packets and the
//! current time are fed in, outgoing packets are returned, and state changes
//! are reported through the [`AdvertiserCallback`] passed to each call.

use core::net::{IpAddr, SocketAddr};

use std::collections::HashMap;

use embassy_time::Instant;

use log::{debug, info, warn};

use crate::record::DnsPacket;
use crate::repeater::{Announcer, Prober, RepeaterEvent};
use crate::repository::{RecordRepository, RepositoryError};
use crate::service::ServiceInfo;
use crate::{AdvertiserConfig, MdnsError, ServiceId};

/// Where the io layer should send an outgoing packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Destination {
    /// The mDNS group of every address family the socket has joined.
    Multicast,
    /// One concrete peer (unicast replies and legacy queries).
    To(SocketAddr),
}

/// One packet the caller must put on the wire.
#[derive(Debug, Clone)]
pub struct OutgoingPacket {
    pub destination: Destination,
    pub packet: DnsPacket,
}

/// State change notifications of one interface advertiser.
///
/// Callbacks are invoked synchronously, on the thread driving the
/// advertiser, in the order the events occur.
pub trait AdvertiserCallback {
    /// Probing for the service finished without a conflict; announcing has
    /// started.
    fn on_register_service_succeeded(&mut self, service_id: ServiceId);

    /// A peer contradicted our records. During probing the owner must pick
    /// a new instance name and call [`InterfaceAdvertiser::rename_service`];
    /// for a published service the owner may rename or remove.
    fn on_service_conflict(&mut self, service_id: ServiceId, during_probing: bool);

    /// The last service finished exiting; the advertiser has no more work.
    fn on_all_services_removed(&mut self);
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ServiceState {
    Probing,
    Announcing,
    Active,
    Exiting,
}

/// The advertiser state machine for one interface socket.
pub struct InterfaceAdvertiser {
    repository: RecordRepository,
    prober: Prober,
    announcer: Announcer,
    states: HashMap<ServiceId, ServiceState>,
}

impl InterfaceAdvertiser {
    pub fn new(config: AdvertiserConfig, rand: fn(&mut [u8])) -> Result<Self, MdnsError> {
        let repository = RecordRepository::new(config.clone(), rand)?;

        Ok(Self {
            repository,
            prober: Prober::new(config.clone(), rand),
            announcer: Announcer::new(config),
            states: HashMap::new(),
        })
    }

    pub fn repository(&self) -> &RecordRepository {
        &self.repository
    }

    pub fn service_count(&self) -> usize {
        self.states.len()
    }

    /// Replaces the interface address set. The caller is expected to follow
    /// up with [`InterfaceAdvertiser::restart_announcing`] so peers learn
    /// the new address records.
    pub fn update_addresses(&mut self, addresses: &[IpAddr]) -> Result<(), MdnsError> {
        self.repository.update_addresses(addresses)
    }

    /// Registers a service and starts probing for its name.
    ///
    /// An exiting service displaced by the new registration has its goodbye
    /// cancelled; its id is returned.
    pub fn add_service(
        &mut self,
        id: ServiceId,
        info: ServiceInfo,
        now: Instant,
    ) -> Result<Option<ServiceId>, RepositoryError> {
        let displaced = self.repository.add_service(id, info)?;

        if let Some(displaced) = displaced {
            debug!("Service {displaced} displaced by re-registration of its name");
            self.announcer.stop(displaced);
            self.states.remove(&displaced);
        }

        self.start_probing(id, now)?;

        Ok(displaced)
    }

    /// Replaces the subtype set of a service without a new probe cycle;
    /// only shared PTR records change.
    pub fn update_service(
        &mut self,
        id: ServiceId,
        subtypes: Vec<String>,
    ) -> Result<(), RepositoryError> {
        self.repository.update_service(id, subtypes)
    }

    /// Re-registers a service under a new instance name after a conflict
    /// and restarts probing.
    pub fn rename_service(
        &mut self,
        id: ServiceId,
        info: ServiceInfo,
        now: Instant,
    ) -> Result<(), RepositoryError> {
        self.prober.stop(id);
        self.announcer.stop(id);
        self.repository.rename_service(id, info)?;
        self.start_probing(id, now)?;

        Ok(())
    }

    /// Removes a service.
    ///
    /// A probing service is cancelled silently; a published one exits with
    /// a delayed TTL=0 goodbye, and its records are destroyed once the
    /// goodbye is dispatched.
    pub fn remove_service(
        &mut self,
        id: ServiceId,
        now: Instant,
        callback: &mut impl AdvertiserCallback,
    ) {
        match self.states.get(&id) {
            Some(ServiceState::Probing) => {
                self.prober.stop(id);
                self.repository.remove_service(id);
                self.states.remove(&id);

                if self.states.is_empty() {
                    callback.on_all_services_removed();
                }
            }
            Some(ServiceState::Announcing) | Some(ServiceState::Active) => {
                self.announcer.stop(id);

                if let Some(exit) = self.repository.exit_service(id) {
                    self.announcer.announce_exit(&exit, now);
                    self.states.insert(id, ServiceState::Exiting);
                }
            }
            Some(ServiceState::Exiting) | None => (),
        }
    }

    /// Exits every published service immediately and returns the goodbye
    /// packets. Used on teardown, where the usual exit delay does not apply.
    ///
    /// Probing services never announced anything, so they vanish without a
    /// goodbye; a service already exiting keeps its (now flushed) goodbye.
    pub fn destroy(&mut self) -> Vec<OutgoingPacket> {
        let mut packets = Vec::new();

        let entries: Vec<(ServiceId, ServiceState)> =
            self.states.iter().map(|(id, state)| (*id, *state)).collect();

        for (id, state) in entries {
            self.prober.stop(id);
            self.announcer.stop(id);

            let goodbye = match state {
                ServiceState::Probing => None,
                ServiceState::Announcing | ServiceState::Active => {
                    self.repository.exit_service(id)
                }
                ServiceState::Exiting => self.repository.goodbye_info(id),
            };

            if let Some(exit) = goodbye {
                packets.push(OutgoingPacket {
                    destination: Destination::Multicast,
                    packet: exit.packet,
                });
            }
        }

        self.repository.clear_services();
        self.states.clear();

        packets
    }

    /// Rebuilds and restarts the announcements of every published service,
    /// e.g. after an address change.
    pub fn restart_announcing(&mut self, now: Instant) {
        let ids: Vec<ServiceId> = self
            .states
            .iter()
            .filter(|(_, state)| {
                matches!(state, ServiceState::Announcing | ServiceState::Active)
            })
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            match self.repository.announcement_info(id) {
                Ok(info) => {
                    self.announcer.announce(&info, now);
                    self.states.insert(id, ServiceState::Announcing);
                }
                Err(err) => warn!("Cannot rebuild announcement for service {id}: {err}"),
            }
        }
    }

    /// The next instant at which [`InterfaceAdvertiser::advance`] has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.prober.next_deadline(), self.announcer.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Drives all timer-based work due at `now` and returns the packets to
    /// send.
    pub fn advance(
        &mut self,
        now: Instant,
        callback: &mut impl AdvertiserCallback,
    ) -> Vec<OutgoingPacket> {
        let mut packets = Vec::new();

        for event in self.prober.poll(now) {
            match event {
                RepeaterEvent::Send { packet, .. } => packets.push(OutgoingPacket {
                    destination: Destination::Multicast,
                    packet,
                }),
                RepeaterEvent::Finished { service_id } => {
                    self.on_probing_finished(service_id, now, callback);
                }
            }
        }

        for event in self.announcer.poll(now) {
            match event {
                RepeaterEvent::Send { packet, .. } => packets.push(OutgoingPacket {
                    destination: Destination::Multicast,
                    packet,
                }),
                RepeaterEvent::Finished { service_id } => {
                    self.on_announcing_finished(service_id, callback);
                }
            }
        }

        packets
    }

    /// Feeds one incoming packet through the repository: queries produce a
    /// reply, responses are checked for conflicts.
    pub fn handle_packet(
        &mut self,
        incoming: &DnsPacket,
        src: SocketAddr,
        callback: &mut impl AdvertiserCallback,
    ) -> Vec<OutgoingPacket> {
        if !incoming.is_response() {
            return match self.repository.get_reply(incoming, src) {
                Some(reply) => vec![OutgoingPacket {
                    destination: Destination::To(reply.destination),
                    packet: reply.packet,
                }],
                None => Vec::new(),
            };
        }

        let mut conflicts: Vec<ServiceId> = self
            .repository
            .get_conflicting_services(incoming)
            .into_iter()
            .collect();
        conflicts.sort_unstable();

        for id in conflicts {
            let during_probing = self.states.get(&id) == Some(&ServiceState::Probing);

            info!(
                "Name conflict from {src} for service {id} (probing: {during_probing})"
            );

            if during_probing {
                // Stop the probe sequence; the owner renames and restarts.
                self.prober.stop(id);
            }

            callback.on_service_conflict(id, during_probing);
        }

        Vec::new()
    }

    fn start_probing(&mut self, id: ServiceId, now: Instant) -> Result<(), RepositoryError> {
        let probing = self.repository.set_service_probing(id)?;
        self.prober.start(&probing, now);
        self.states.insert(id, ServiceState::Probing);

        Ok(())
    }

    fn on_probing_finished(
        &mut self,
        id: ServiceId,
        now: Instant,
        callback: &mut impl AdvertiserCallback,
    ) {
        match self.repository.on_probing_succeeded(id) {
            Ok(announcement) => {
                info!("Probing succeeded for service {id}, announcing");

                self.announcer.announce(&announcement, now);
                self.states.insert(id, ServiceState::Announcing);
                callback.on_register_service_succeeded(id);
            }
            Err(err) => warn!("Probing finished for unknown service {id}: {err}"),
        }
    }

    fn on_announcing_finished(&mut self, id: ServiceId, callback: &mut impl AdvertiserCallback) {
        match self.states.get(&id) {
            Some(ServiceState::Exiting) => {
                debug!("Exit announcement dispatched for service {id}");

                self.repository.remove_service(id);
                self.states.remove(&id);

                if self.states.is_empty() {
                    callback.on_all_services_removed();
                }
            }
            _ => {
                self.states.insert(id, ServiceState::Active);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use core::net::SocketAddr;
    use core::str::FromStr;

    use embassy_time::Duration;

    use domain::base::iana::Rtype;
    use domain::base::ToName;

    use crate::name::DnsName;
    use crate::record::{DnsQuestion, DnsRecord, Rdata, FLAGS_QUERY, FLAGS_RESPONSE};

    use super::*;

    const ID: ServiceId = 1;

    #[derive(Default)]
    struct Events {
        succeeded: Vec<ServiceId>,
        conflicts: Vec<(ServiceId, bool)>,
        all_removed: usize,
    }

    impl AdvertiserCallback for Events {
        fn on_register_service_succeeded(&mut self, service_id: ServiceId) {
            self.succeeded.push(service_id);
        }

        fn on_service_conflict(&mut self, service_id: ServiceId, during_probing: bool) {
            self.conflicts.push((service_id, during_probing));
        }

        fn on_all_services_removed(&mut self) {
            self.all_removed += 1;
        }
    }

    fn zero_rand(buf: &mut [u8]) {
        buf.fill(0);
    }

    fn advertiser() -> InterfaceAdvertiser {
        let mut advertiser =
            InterfaceAdvertiser::new(AdvertiserConfig::new(), zero_rand).unwrap();
        advertiser
            .update_addresses(&[core::net::IpAddr::from_str("192.0.2.111").unwrap()])
            .unwrap();
        advertiser
    }

    fn test_service() -> ServiceInfo {
        ServiceInfo::new("MyTestService", "_testservice._tcp", 12345).unwrap()
    }

    fn probe_until_announcing(
        advertiser: &mut InterfaceAdvertiser,
        events: &mut Events,
        t0: Instant,
    ) -> Vec<OutgoingPacket> {
        let mut sent = Vec::new();
        for shot in 0..3 {
            sent.extend(advertiser.advance(t0 + Duration::from_millis(250 * shot), events));
        }
        sent
    }

    #[test]
    fn probe_then_announce_lifecycle() {
        let t0 = Instant::from_millis(0);
        let mut advertiser = advertiser();
        let mut events = Events::default();

        advertiser.add_service(ID, test_service(), t0).unwrap();

        let sent = probe_until_announcing(&mut advertiser, &mut events, t0);

        // Three probe queries, then the first announcement.
        assert_eq!(sent.len(), 4);
        for probe in &sent[..3] {
            assert_eq!(probe.packet.flags, FLAGS_QUERY);
            assert_eq!(probe.destination, Destination::Multicast);
            assert_eq!(probe.packet.questions.len(), 1);
        }
        assert_eq!(sent[3].packet.flags, FLAGS_RESPONSE);
        assert_eq!(events.succeeded, vec![ID]);
    }

    #[test]
    fn query_gets_a_reply_once_active() {
        let t0 = Instant::from_millis(0);
        let mut advertiser = advertiser();
        let mut events = Events::default();

        advertiser.add_service(ID, test_service(), t0).unwrap();
        probe_until_announcing(&mut advertiser, &mut events, t0);

        let mut query = DnsPacket::query();
        query.questions.push(DnsQuestion {
            name: DnsName::from_str("_testservice._tcp.local").unwrap(),
            rtype: Rtype::PTR,
            unicast_response: false,
        });

        let src = SocketAddr::from_str("192.0.2.99:5353").unwrap();
        let replies = advertiser.handle_packet(&query, src, &mut events);

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].packet.flags, FLAGS_RESPONSE);
        assert!(matches!(replies[0].destination, Destination::To(_)));
    }

    #[test]
    fn conflict_during_probing_stops_the_prober() {
        let t0 = Instant::from_millis(0);
        let mut advertiser = advertiser();
        let mut events = Events::default();

        advertiser.add_service(ID, test_service(), t0).unwrap();
        advertiser.advance(t0, &mut events);

        let mut response = DnsPacket::response();
        response.answers.push(DnsRecord::new(
            DnsName::from_str("MyTestService._testservice._tcp.local").unwrap(),
            120_000,
            true,
            Rdata::Srv {
                priority: 0,
                weight: 0,
                port: 4242,
                target: DnsName::from_str("OtherHost.local").unwrap(),
            },
        ));

        let src = SocketAddr::from_str("192.0.2.99:5353").unwrap();
        advertiser.handle_packet(&response, src, &mut events);

        assert_eq!(events.conflicts, vec![(ID, true)]);
        // No further probes fire.
        assert!(advertiser
            .advance(t0 + Duration::from_millis(10_000), &mut events)
            .is_empty());
        assert!(events.succeeded.is_empty());
    }

    #[test]
    fn rename_restarts_probing() {
        let t0 = Instant::from_millis(0);
        let mut advertiser = advertiser();
        let mut events = Events::default();

        advertiser.add_service(ID, test_service(), t0).unwrap();
        advertiser.advance(t0, &mut events);

        let renamed = test_service().renamed("MyTestService (2)").unwrap();
        advertiser.rename_service(ID, renamed, t0).unwrap();

        let sent = probe_until_announcing(&mut advertiser, &mut events, t0);
        let probe = &sent[0].packet;
        let expected = crate::name::instance_name(
            "MyTestService (2)",
            &["_testservice".to_string(), "_tcp".to_string()],
        )
        .unwrap();
        assert!(probe.questions[0].name.name_eq(&expected));
        assert_eq!(events.succeeded, vec![ID]);
    }

    #[test]
    fn remove_while_probing_is_silent() {
        let t0 = Instant::from_millis(0);
        let mut advertiser = advertiser();
        let mut events = Events::default();

        advertiser.add_service(ID, test_service(), t0).unwrap();
        advertiser.remove_service(ID, t0, &mut events);

        assert_eq!(events.all_removed, 1);
        assert_eq!(advertiser.service_count(), 0);
        assert!(advertiser
            .advance(t0 + Duration::from_millis(10_000), &mut events)
            .is_empty());
    }

    #[test]
    fn remove_after_publish_sends_a_delayed_goodbye() {
        let t0 = Instant::from_millis(0);
        let mut advertiser = advertiser();
        let mut events = Events::default();

        advertiser.add_service(ID, test_service(), t0).unwrap();
        probe_until_announcing(&mut advertiser, &mut events, t0);

        let t1 = Instant::from_millis(60_000);
        advertiser.remove_service(ID, t1, &mut events);

        // Nothing before the exit delay elapses.
        assert!(advertiser.advance(t1, &mut events).is_empty());

        let sent = advertiser.advance(t1 + Duration::from_millis(100), &mut events);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].packet.answers[0].ttl_ms, 0);

        assert_eq!(events.all_removed, 1);
        assert_eq!(advertiser.service_count(), 0);
        assert_eq!(advertiser.repository().service_count(), 0);
    }

    #[test]
    fn destroy_sends_immediate_goodbyes() {
        let t0 = Instant::from_millis(0);
        let mut advertiser = advertiser();
        let mut events = Events::default();

        advertiser.add_service(ID, test_service(), t0).unwrap();
        probe_until_announcing(&mut advertiser, &mut events, t0);

        let packets = advertiser.destroy();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].packet.answers[0].ttl_ms, 0);
        assert_eq!(advertiser.service_count(), 0);
    }

    #[test]
    fn displaced_exiting_service_goodbye_is_cancelled() {
        let t0 = Instant::from_millis(0);
        let mut advertiser = advertiser();
        let mut events = Events::default();

        advertiser.add_service(ID, test_service(), t0).unwrap();
        probe_until_announcing(&mut advertiser, &mut events, t0);
        advertiser.remove_service(ID, t0, &mut events);

        let displaced = advertiser.add_service(2, test_service(), t0).unwrap();
        assert_eq!(displaced, Some(ID));

        // The cancelled goodbye never fires; the new service probes instead.
        let sent = advertiser.advance(t0 + Duration::from_millis(100), &mut events);
        assert!(sent.iter().all(|packet| packet.packet.flags == FLAGS_QUERY));
    }
}
