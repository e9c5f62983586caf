//! The multinetwork socket client: maps listener subscriptions to the
//! per-interface sockets of one or more networks, fans outgoing multicast
//! packets to the right subset of sockets, and dispatches received packets
//! back to the subscribed listeners.
//!
//! Sockets are created and destroyed by the injected [`SocketProvider`];
//! this client only does the bookkeeping. Listeners and networks are opaque
//! caller-supplied tokens, so no trait-object lifetimes leak into the maps.
//!
//! Network matching is exact: a socket belongs to one network or to no
//! network at all (e.g. a tethering downstream), and a send targeted at the
//! null network reaches only null-network sockets. A *request* for the null
//! network, in contrast, subscribes the listener to every socket.

use core::fmt;
use core::net::SocketAddr;

use std::collections::HashMap;

use log::{debug, error, warn};

use crate::record::{parse_message, DnsPacket};
use crate::Token;

use super::UdpSend;

/// The logical identity of one per-interface socket: the socket token plus
/// the network it belongs to (`None` for null-network interfaces).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct SocketKey {
    pub socket: Token,
    pub network: Option<Token>,
}

/// Errors of the subscription bookkeeping.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MultinetError {
    /// The listener token already has an active network request.
    DuplicateListener,
    /// The socket token is not active.
    UnknownSocket,
}

impl fmt::Display for MultinetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateListener => write!(f, "Listener already has a network request"),
            Self::UnknownSocket => write!(f, "Unknown socket"),
        }
    }
}

impl std::error::Error for MultinetError {}

/// The injected collaborator that owns socket creation and teardown.
///
/// After a request, the provider reports sockets through
/// [`MultinetworkSocketClient::on_socket_created`] /
/// [`MultinetworkSocketClient::on_socket_destroyed`].
pub trait SocketProvider {
    /// Start producing sockets for `network`; `None` requests every network.
    fn request_sockets(&mut self, listener: Token, network: Option<Token>);

    /// Stop producing sockets on behalf of this listener.
    fn release_sockets(&mut self, listener: Token);
}

/// What listeners hear about their subscribed sockets.
///
/// Callbacks run synchronously on the thread driving the client, tagged with
/// the listener token they belong to.
pub trait MultinetCallback {
    fn on_socket_created(&mut self, listener: Token, key: SocketKey);

    fn on_socket_destroyed(&mut self, listener: Token, key: SocketKey);

    /// A response packet arrived on a subscribed socket.
    fn on_response_received(
        &mut self,
        listener: Token,
        key: SocketKey,
        packet: &DnsPacket,
        src: SocketAddr,
    );

    /// A packet failed to parse. `packet_number` counts the packets received
    /// on that socket, identifying the offender without retaining it.
    fn on_failed_to_parse(&mut self, listener: Token, key: SocketKey, packet_number: u64);
}

struct ActiveSocket<S> {
    socket: S,
    key: SocketKey,
    joined_v4: bool,
    joined_v6: bool,
    /// Listeners sharing this socket; the entry is dropped with the last one.
    listeners: Vec<Token>,
    packet_number: u64,
}

/// The fan-out layer between listeners, networks and interface sockets.
pub struct MultinetworkSocketClient<S> {
    /// One requested network per listener; `None` means every network.
    requests: HashMap<Token, Option<Token>>,
    sockets: HashMap<Token, ActiveSocket<S>>,
}

impl<S> Default for MultinetworkSocketClient<S>
where
    S: UdpSend,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> MultinetworkSocketClient<S>
where
    S: UdpSend,
{
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
            sockets: HashMap::new(),
        }
    }

    pub fn active_socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Subscribes a listener to the sockets of `network` (`None` = all) and
    /// forwards the request to the socket provider.
    pub fn notify_network_requested(
        &mut self,
        listener: Token,
        network: Option<Token>,
        provider: &mut impl SocketProvider,
    ) -> Result<(), MultinetError> {
        if self.requests.contains_key(&listener) {
            return Err(MultinetError::DuplicateListener);
        }

        debug!("Listener {listener} requested network {network:?}");

        self.requests.insert(listener, network);
        provider.request_sockets(listener, network);

        Ok(())
    }

    /// Drops a listener's subscription. Sockets no longer wanted by any
    /// listener lose their packet handler.
    pub fn notify_network_unrequested(
        &mut self,
        listener: Token,
        provider: &mut impl SocketProvider,
        callback: &mut impl MultinetCallback,
    ) {
        if self.requests.remove(&listener).is_none() {
            warn!("Listener {listener} has no active network request");
            return;
        }

        self.sockets.retain(|_, active| {
            let Some(index) = active.listeners.iter().position(|l| *l == listener) else {
                return true;
            };

            callback.on_socket_destroyed(listener, active.key);
            active.listeners.swap_remove(index);

            !active.listeners.is_empty()
        });

        provider.release_sockets(listener);
    }

    /// Accepts a freshly created socket from the provider and subscribes
    /// every matching listener to it.
    pub fn on_socket_created(
        &mut self,
        key: SocketKey,
        socket: S,
        joined_v4: bool,
        joined_v6: bool,
        callback: &mut impl MultinetCallback,
    ) {
        let listeners: Vec<Token> = self
            .requests
            .iter()
            .filter(|(_, network)| network.is_none() || **network == key.network)
            .map(|(listener, _)| *listener)
            .collect();

        for listener in &listeners {
            callback.on_socket_created(*listener, key);
        }

        self.sockets.insert(
            key.socket,
            ActiveSocket {
                socket,
                key,
                joined_v4,
                joined_v6,
                listeners,
                packet_number: 0,
            },
        );
    }

    /// Removes a socket torn down by the provider.
    pub fn on_socket_destroyed(&mut self, socket: Token, callback: &mut impl MultinetCallback) {
        let Some(active) = self.sockets.remove(&socket) else {
            return;
        };

        for listener in &active.listeners {
            callback.on_socket_destroyed(*listener, active.key);
        }
    }

    /// Sends one multicast request to every active socket of exactly
    /// `target_network` whose joins cover the destination address family.
    ///
    /// With `ipv6_on_ipv6_only` set, an IPv6 packet is only sent if no
    /// socket on the target network has joined the IPv4 group; this is the
    /// fallback for IPv6-only networks.
    pub async fn send_multicast_request(
        &mut self,
        data: &[u8],
        destination: SocketAddr,
        target_network: Option<Token>,
        ipv6_on_ipv6_only: bool,
    ) {
        if destination.is_ipv6() && ipv6_on_ipv6_only {
            let network_has_v4 = self
                .sockets
                .values()
                .any(|active| active.key.network == target_network && active.joined_v4);

            if network_has_v4 {
                debug!("Skipping IPv6 send, network {target_network:?} has IPv4");
                return;
            }
        }

        for active in self.sockets.values_mut() {
            if active.key.network != target_network {
                continue;
            }

            let family_joined = if destination.is_ipv4() {
                active.joined_v4
            } else {
                active.joined_v6
            };

            if !family_joined {
                continue;
            }

            if let Err(err) = active.socket.send(destination, data).await {
                error!(
                    "Failed to send multicast request on socket {}: {err}",
                    active.key.socket
                );
            }
        }
    }

    /// Feeds one received datagram through the decoder and dispatches it to
    /// the socket's listeners.
    ///
    /// Packets that are not response messages are dropped silently (queries
    /// are handled elsewhere); malformed packets are reported with their
    /// per-socket packet number.
    pub fn handle_received(
        &mut self,
        socket: Token,
        data: &[u8],
        src: SocketAddr,
        callback: &mut impl MultinetCallback,
    ) -> Result<(), MultinetError> {
        let active = self
            .sockets
            .get_mut(&socket)
            .ok_or(MultinetError::UnknownSocket)?;

        active.packet_number += 1;

        match parse_message(data) {
            Ok(packet) if packet.is_response() => {
                for listener in &active.listeners {
                    callback.on_response_received(*listener, active.key, &packet, src);
                }
            }
            Ok(_) => {
                debug!("Ignoring non-response packet from {src}");
            }
            Err(err) => {
                debug!("Failed to parse packet #{} from {src}: {err}", active.packet_number);

                for listener in &active.listeners {
                    callback.on_failed_to_parse(*listener, active.key, active.packet_number);
                }
            }
        }

        Ok(())
    }
}
