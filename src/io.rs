//! The async io layer: socket traits, the reply sender and the event loop
//! driving an [`AdvertiserManager`] from timers and sockets.
//!
//! Everything here runs on one cooperative task. The manager lives in a
//! non-`Send` `RefCell` behind that task; public mutators enqueue work by
//! taking the cell synchronously and poking the wakeup signal, never by
//! touching advertiser state from another thread.

use core::cell::RefCell;
use core::fmt;
use core::net::{IpAddr, SocketAddr, SocketAddrV4, SocketAddrV6};
use core::pin::pin;

use std::collections::HashMap;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Instant, Timer};

use log::{debug, error, warn};

use crate::advertiser::{Destination, OutgoingPacket};
use crate::manager::{AdvertiserManager, InterfacePacket, ManagerCallback};
use crate::record::parse_message;
use crate::repository::RepositoryError;
use crate::service::ServiceInfo;
use crate::{MdnsError, ServiceId, Token, MDNS_IPV4_GROUP, MDNS_IPV6_GROUP, MDNS_PORT};

pub mod multinet;

/// The largest packet the receive path accepts. mDNS allows up to 9000
/// bytes on links that carry it (RFC 6762 §17).
pub const MAX_PACKET_SIZE: usize = 9000;

/// A wrapper for mDNS and IO errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MdnsIoError<E> {
    MdnsError(MdnsError),
    IoError(E),
}

impl<E> From<MdnsError> for MdnsIoError<E> {
    fn from(err: MdnsError) -> Self {
        Self::MdnsError(err)
    }
}

impl<E> fmt::Display for MdnsIoError<E>
where
    E: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MdnsError(err) => write!(f, "mDNS error: {}", err),
            Self::IoError(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl<E> std::error::Error for MdnsIoError<E> where E: fmt::Display + fmt::Debug {}

/// The datagram send half of a per-interface socket.
///
/// Socket creation belongs to the injected socket provider; the advertiser
/// only ever holds these halves.
pub trait UdpSend {
    type Error: fmt::Debug + fmt::Display;

    async fn send(&mut self, remote: SocketAddr, data: &[u8]) -> Result<(), Self::Error>;
}

impl<T> UdpSend for &mut T
where
    T: UdpSend,
{
    type Error = T::Error;

    async fn send(&mut self, remote: SocketAddr, data: &[u8]) -> Result<(), Self::Error> {
        (**self).send(remote, data).await
    }
}

/// The datagram receive half of a per-interface socket.
pub trait UdpReceive {
    type Error: fmt::Debug + fmt::Display;

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<(usize, SocketAddr), Self::Error>;
}

impl<T> UdpReceive for &mut T
where
    T: UdpReceive,
{
    type Error = T::Error;

    async fn receive(&mut self, buffer: &mut [u8]) -> Result<(usize, SocketAddr), Self::Error> {
        (**self).receive(buffer).await
    }
}

/// Serializes prepared packets and emits them on one interface socket.
///
/// Multicast packets go to the group of every address family the socket has
/// joined; IPv6 destinations always carry the interface index as scope id.
/// Send failures are logged and swallowed: the next scheduled announcement
/// retries implicitly.
pub struct ReplySender<S> {
    socket: S,
    ipv4: bool,
    ipv6_interface: Option<u32>,
}

impl<S> ReplySender<S>
where
    S: UdpSend,
{
    /// Creates a sender for a socket that joined the IPv4 group
    /// (`ipv4 == true`) and/or the IPv6 group on the given interface.
    pub const fn new(socket: S, ipv4: bool, ipv6_interface: Option<u32>) -> Self {
        Self {
            socket,
            ipv4,
            ipv6_interface,
        }
    }

    pub async fn send(&mut self, outgoing: &OutgoingPacket) -> Result<(), MdnsError> {
        let data = outgoing.packet.to_wire()?;

        match outgoing.destination {
            Destination::To(addr) => self.send_once(self.scoped(addr), &data).await,
            Destination::Multicast => {
                if self.ipv4 {
                    let group = SocketAddr::V4(SocketAddrV4::new(MDNS_IPV4_GROUP, MDNS_PORT));
                    self.send_once(group, &data).await;
                }

                if let Some(interface) = self.ipv6_interface {
                    let group = SocketAddr::V6(SocketAddrV6::new(
                        MDNS_IPV6_GROUP,
                        MDNS_PORT,
                        0,
                        interface,
                    ));
                    self.send_once(group, &data).await;
                }
            }
        }

        Ok(())
    }

    /// Applies the interface index as scope id to IPv6 destinations that
    /// lack one. Link-local unicast and multicast replies are unroutable
    /// without it.
    fn scoped(&self, addr: SocketAddr) -> SocketAddr {
        match (addr, self.ipv6_interface) {
            (SocketAddr::V6(mut v6), Some(interface)) if v6.scope_id() == 0 => {
                v6.set_scope_id(interface);
                SocketAddr::V6(v6)
            }
            _ => addr,
        }
    }

    async fn send_once(&mut self, remote: SocketAddr, data: &[u8]) {
        debug!("Sending {} bytes to {remote}", data.len());

        if let Err(err) = self.socket.send(remote, data).await {
            error!("Failed to send mDNS packet to {remote}: {err}");
        }
    }
}

/// Drives an [`AdvertiserManager`] from sockets, timers and a wakeup signal.
///
/// The owning task runs [`AdvertiserIo::run`] (or composes the `run_timers` /
/// `run_receiver` halves for multi-interface setups); other code on the same
/// thread mutates the advertiser through the synchronous methods, which poke
/// the signal so the loop recomputes its deadline.
pub struct AdvertiserIo<'a, S> {
    manager: RefCell<AdvertiserManager>,
    senders: Mutex<NoopRawMutex, HashMap<Token, ReplySender<S>>>,
    wakeup: &'a Signal<NoopRawMutex, ()>,
}

impl<'a, S> AdvertiserIo<'a, S>
where
    S: UdpSend,
{
    pub fn new(manager: AdvertiserManager, wakeup: &'a Signal<NoopRawMutex, ()>) -> Self {
        Self {
            manager: RefCell::new(manager),
            senders: Mutex::new(HashMap::new()),
            wakeup,
        }
    }

    /// Brings an interface with its send half under management.
    pub async fn add_interface(
        &self,
        interface: Token,
        addresses: &[IpAddr],
        sender: ReplySender<S>,
        now: Instant,
    ) -> Result<(), RepositoryError> {
        self.manager
            .borrow_mut()
            .add_interface(interface, addresses, now)?;
        self.senders.lock().await.insert(interface, sender);
        self.wakeup.signal(());

        Ok(())
    }

    /// Removes an interface, flushing its goodbye packets before the send
    /// half is dropped.
    pub async fn remove_interface(&self, interface: Token) {
        let goodbyes = self.manager.borrow_mut().remove_interface(interface);

        let mut senders = self.senders.lock().await;
        if let Some(sender) = senders.get_mut(&interface) {
            for outgoing in &goodbyes {
                if let Err(err) = sender.send(outgoing).await {
                    warn!("Dropping malformed goodbye packet: {err}");
                }
            }
        }
        senders.remove(&interface);

        self.wakeup.signal(());
    }

    pub fn add_service(&self, id: ServiceId, info: ServiceInfo) -> Result<(), RepositoryError> {
        let result = self
            .manager
            .borrow_mut()
            .add_service(id, info, Instant::now());
        self.wakeup.signal(());

        result
    }

    pub fn remove_service(&self, id: ServiceId) {
        self.manager.borrow_mut().remove_service(id, Instant::now());
        self.wakeup.signal(());
    }

    pub fn update_service(
        &self,
        id: ServiceId,
        subtypes: Vec<String>,
    ) -> Result<(), RepositoryError> {
        let result = self.manager.borrow_mut().update_service(id, subtypes);
        self.wakeup.signal(());

        result
    }

    pub fn update_interface_addresses(
        &self,
        interface: Token,
        addresses: &[IpAddr],
    ) -> Result<(), RepositoryError> {
        let result = self.manager.borrow_mut().update_interface_addresses(
            interface,
            addresses,
            Instant::now(),
        );
        self.wakeup.signal(());

        result
    }

    /// Runs the timer half: sleeps until the earliest repeater deadline (or
    /// a wakeup poke) and flushes the due probe/announcement packets.
    pub async fn run_timers<C>(&self, callback: &RefCell<C>) -> Result<(), MdnsIoError<S::Error>>
    where
        C: ManagerCallback,
    {
        loop {
            let deadline = self.manager.borrow().next_deadline();

            match deadline {
                Some(deadline) => {
                    select(Timer::at(deadline), self.wakeup.wait()).await;
                }
                None => self.wakeup.wait().await,
            }

            let packets = {
                let mut manager = self.manager.borrow_mut();
                let mut callback = callback.borrow_mut();
                manager.advance(Instant::now(), &mut *callback)
            };

            self.send_all(packets).await;
        }
    }

    /// Runs the receive half for one interface: parses incoming packets,
    /// feeds them to the advertiser and flushes the replies.
    ///
    /// One-shot legacy queries (source port not 5353) are answered privately
    /// at the source address, echoing the query id.
    pub async fn run_receiver<R, C>(
        &self,
        interface: Token,
        mut recv: R,
        callback: &RefCell<C>,
    ) -> Result<(), MdnsIoError<S::Error>>
    where
        R: UdpReceive<Error = S::Error>,
        C: ManagerCallback,
    {
        let mut buf = vec![0; MAX_PACKET_SIZE];

        loop {
            let (len, src) = recv
                .receive(&mut buf)
                .await
                .map_err(MdnsIoError::IoError)?;

            let incoming = match parse_message(&buf[..len.min(buf.len())]) {
                Ok(incoming) => incoming,
                Err(err) => {
                    debug!("Dropping unparseable packet from {src}: {err}");
                    continue;
                }
            };

            let mut packets = {
                let mut manager = self.manager.borrow_mut();
                let mut callback = callback.borrow_mut();
                manager.handle_packet(interface, &incoming, src, Instant::now(), &mut *callback)
            };

            if src.port() != MDNS_PORT {
                debug!("Replying privately to a one-shot query from {src}");

                for (_, outgoing) in &mut packets {
                    outgoing.destination = Destination::To(src);
                    outgoing.packet.id = incoming.id;
                }
            }

            self.send_all(packets).await;
        }
    }

    /// Runs both halves for a single-interface advertiser.
    pub async fn run<R, C>(
        &self,
        interface: Token,
        recv: R,
        callback: &RefCell<C>,
    ) -> Result<(), MdnsIoError<S::Error>>
    where
        R: UdpReceive<Error = S::Error>,
        C: ManagerCallback,
    {
        let mut timers = pin!(self.run_timers(callback));
        let mut receiver = pin!(self.run_receiver(interface, recv, callback));

        match select(&mut timers, &mut receiver).await {
            Either::First(result) => result,
            Either::Second(result) => result,
        }
    }

    async fn send_all(&self, packets: Vec<InterfacePacket>) {
        if packets.is_empty() {
            return;
        }

        let mut senders = self.senders.lock().await;

        for (interface, outgoing) in packets {
            match senders.get_mut(&interface) {
                Some(sender) => {
                    if let Err(err) = sender.send(&outgoing).await {
                        warn!("Dropping malformed outgoing packet: {err}");
                    }
                }
                None => debug!("No socket for interface {interface}, dropping packet"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use core::convert::Infallible;
    use core::net::{IpAddr, Ipv6Addr};
    use core::str::FromStr;

    use std::rc::Rc;

    use domain::base::iana::Rtype;

    use embassy_futures::block_on;

    use crate::record::{parse_message, DnsPacket, DnsQuestion, FLAGS_RESPONSE};
    use crate::AdvertiserConfig;

    use super::*;

    const IF1: Token = 101;

    type SendLog = Rc<RefCell<Vec<(SocketAddr, Vec<u8>)>>>;

    struct FakeSend {
        log: SendLog,
    }

    impl UdpSend for FakeSend {
        type Error = Infallible;

        async fn send(&mut self, remote: SocketAddr, data: &[u8]) -> Result<(), Self::Error> {
            self.log.borrow_mut().push((remote, data.to_vec()));
            Ok(())
        }
    }

    /// Yields the queued datagrams in order, then stays pending like an
    /// idle socket.
    struct FakeReceive {
        packets: Vec<(Vec<u8>, SocketAddr)>,
    }

    impl UdpReceive for FakeReceive {
        type Error = Infallible;

        async fn receive(&mut self, buffer: &mut [u8]) -> Result<(usize, SocketAddr), Self::Error> {
            if self.packets.is_empty() {
                core::future::pending().await
            } else {
                let (data, src) = self.packets.remove(0);
                buffer[..data.len()].copy_from_slice(&data);
                Ok((data.len(), src))
            }
        }
    }

    struct NullCallback;

    impl ManagerCallback for NullCallback {
        fn on_register_service_succeeded(&mut self, _service_id: ServiceId) {}

        fn on_service_renamed(&mut self, _service_id: ServiceId, _instance_name: &str) {}
    }

    fn zero_rand(buf: &mut [u8]) {
        buf.fill(0);
    }

    fn sender(log: &SendLog, ipv4: bool, ipv6_interface: Option<u32>) -> ReplySender<FakeSend> {
        ReplySender::new(
            FakeSend { log: log.clone() },
            ipv4,
            ipv6_interface,
        )
    }

    #[test]
    fn scoped_defaults_the_interface_index() {
        let log: SendLog = Rc::default();
        let with_v6 = sender(&log, true, Some(7));

        let link_local = SocketAddr::from_str("[fe80::1]:5353").unwrap();
        let SocketAddr::V6(scoped) = with_v6.scoped(link_local) else {
            panic!("address family changed");
        };
        assert_eq!(scoped.scope_id(), 7);

        // An explicit scope id is preserved.
        let already_scoped = SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::from_str("fe80::1").unwrap(),
            MDNS_PORT,
            0,
            3,
        ));
        let SocketAddr::V6(kept) = with_v6.scoped(already_scoped) else {
            panic!("address family changed");
        };
        assert_eq!(kept.scope_id(), 3);

        // IPv4 destinations and v4-only sockets pass through untouched.
        let v4 = SocketAddr::from_str("192.0.2.1:5353").unwrap();
        assert_eq!(with_v6.scoped(v4), v4);

        let v4_only = sender(&log, true, None);
        assert_eq!(v4_only.scoped(link_local), link_local);
    }

    #[test]
    fn multicast_send_covers_every_joined_family() {
        let log: SendLog = Rc::default();
        let mut dual = sender(&log, true, Some(7));

        let outgoing = OutgoingPacket {
            destination: Destination::Multicast,
            packet: DnsPacket::response(),
        };

        block_on(dual.send(&outgoing)).unwrap();

        {
            let sent = log.borrow();
            assert_eq!(sent.len(), 2);
            assert_eq!(
                sent[0].0,
                SocketAddr::V4(SocketAddrV4::new(MDNS_IPV4_GROUP, MDNS_PORT))
            );
            assert_eq!(
                sent[1].0,
                SocketAddr::V6(SocketAddrV6::new(MDNS_IPV6_GROUP, MDNS_PORT, 0, 7))
            );
            assert_eq!(sent[0].1, sent[1].1);
        }

        log.borrow_mut().clear();

        // A v4-only socket emits on the v4 group alone.
        let mut v4_only = sender(&log, true, None);
        block_on(v4_only.send(&outgoing)).unwrap();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn legacy_one_shot_queries_are_answered_privately() {
        let log: SendLog = Rc::default();
        let wakeup = Signal::<NoopRawMutex, ()>::new();
        let manager = AdvertiserManager::new(AdvertiserConfig::new(), zero_rand);
        let io = AdvertiserIo::new(manager, &wakeup);

        // The host address records answer without any service registered.
        let host = crate::name::host_name("Host-0000000000000000").unwrap();

        let mut query = DnsPacket::query();
        query.id = 0x1234;
        query.questions.push(DnsQuestion {
            name: host,
            rtype: Rtype::A,
            unicast_response: false,
        });

        let legacy_src = SocketAddr::from_str("192.0.2.99:12345").unwrap();
        let mdns_src = SocketAddr::from_str("192.0.2.99:5353").unwrap();
        let recv = FakeReceive {
            packets: vec![
                (query.to_wire().unwrap(), legacy_src),
                (query.to_wire().unwrap(), mdns_src),
            ],
        };

        block_on(async {
            io.add_interface(
                IF1,
                &[IpAddr::from_str("192.0.2.111").unwrap()],
                sender(&log, true, None),
                Instant::from_millis(0),
            )
            .await
            .unwrap();

            let callback = RefCell::new(NullCallback);
            let receiver = pin!(io.run_receiver(IF1, recv, &callback));
            let drained = pin!(async {
                while log.borrow().len() < 2 {
                    embassy_futures::yield_now().await;
                }
            });

            select(receiver, drained).await;
        });

        let sent = log.borrow();
        assert_eq!(sent.len(), 2);

        // The legacy query is answered at its source, echoing the query id.
        assert_eq!(sent[0].0, legacy_src);
        let reply = parse_message(&sent[0].1).unwrap();
        assert_eq!(reply.id, 0x1234);
        assert_eq!(reply.flags, FLAGS_RESPONSE);
        assert!(!reply.answers.is_empty());

        // The same question from the mDNS port goes back to the group.
        assert_eq!(
            sent[1].0,
            SocketAddr::V4(SocketAddrV4::new(MDNS_IPV4_GROUP, MDNS_PORT))
        );
        assert_eq!(parse_message(&sent[1].1).unwrap().id, 0);
    }
}
