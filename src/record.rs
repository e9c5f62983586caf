//! The normalized record and packet model and its bridge to the `domain`
//! wire codec.
//!
//! The repository and the state machines work on these owned, flat types;
//! the `domain` lib is only touched at the serialization / parsing boundary.

use core::net::{Ipv4Addr, Ipv6Addr};

use domain::base::header::Flags;
use domain::base::iana::{Class, Opcode, Rcode, Rtype};
use domain::base::message_builder::MessageBuilder;
use domain::base::rdata::{ComposeRecordData, RecordData};
use domain::base::wire::Composer;
use domain::base::{Message, Question, Record, ToName, Ttl};
use domain::rdata::dnssec::{RtypeBitmap, RtypeBitmapBuilder};
use domain::rdata::{Aaaa, AllRecordData, Nsec, Ptr, Srv, A};

use crate::name::DnsName;
use crate::{MdnsError, ServiceId};

/// TTL of records that carry or name the per-interface host:
/// A/AAAA, SRV and the reverse-DNS PTR.
pub const HOST_RECORD_TTL_MS: u64 = 120_000;

/// TTL of the remaining service records: service PTR, TXT, subtype PTRs and
/// the service type enumeration PTR.
pub const SERVICE_RECORD_TTL_MS: u64 = 4_500_000;

/// Flags of every outgoing response: QR + AA.
pub const FLAGS_RESPONSE: u16 = 0x8400;

/// Flags of every outgoing query.
pub const FLAGS_QUERY: u16 = 0x0000;

/// Top bit of the class field: cache-flush on records, unicast-response on
/// questions (RFC 6762 §10.2 / §5.4).
const CLASS_FLAG: u16 = 0x8000;
const CLASS_MASK: u16 = 0x7fff;

/// The rdata of a normalized record. `Any` appears only in questions.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Rdata {
    Ptr(DnsName),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: DnsName,
    },
    Txt(Vec<u8>),
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Nsec {
        next_domain: DnsName,
        types: Vec<Rtype>,
    },
    Any,
}

impl Rdata {
    pub fn rtype(&self) -> Rtype {
        match self {
            Self::Ptr(_) => Rtype::PTR,
            Self::Srv { .. } => Rtype::SRV,
            Self::Txt(_) => Rtype::TXT,
            Self::A(_) => Rtype::A,
            Self::Aaaa(_) => Rtype::AAAA,
            Self::Nsec { .. } => Rtype::NSEC,
            Self::Any => Rtype::ANY,
        }
    }
}

/// A normalized DNS record: name, millisecond TTL, cache-flush bit, rdata.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DnsRecord {
    pub name: DnsName,
    pub ttl_ms: u64,
    pub cache_flush: bool,
    pub data: Rdata,
}

impl DnsRecord {
    pub fn new(name: DnsName, ttl_ms: u64, cache_flush: bool, data: Rdata) -> Self {
        Self {
            name,
            ttl_ms,
            cache_flush,
            data,
        }
    }

    pub fn rtype(&self) -> Rtype {
        self.data.rtype()
    }

    /// Whether this record answers a question for `qname`/`qtype`.
    pub fn answers(&self, qname: &impl ToName, qtype: Rtype) -> bool {
        (qtype == Rtype::ANY || qtype == self.rtype()) && self.name.name_eq(qname)
    }

    fn wire_ttl(&self) -> Ttl {
        Ttl::from_secs((self.ttl_ms / 1000) as u32)
    }
}

/// A record plus the bookkeeping the repository needs about it.
#[derive(Debug, Clone)]
pub struct RecordInfo {
    pub record: DnsRecord,
    /// The owning service, or `None` for general (host) records.
    pub service_id: Option<ServiceId>,
    /// Shared names (PTR, enumeration PTR) may legitimately be published by
    /// several hosts; unique names (SRV/TXT/A/AAAA) may not.
    pub is_shared_name: bool,
    pub is_probing: bool,
}

/// A question of an outgoing or incoming packet.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DnsQuestion {
    pub name: DnsName,
    pub rtype: Rtype,
    /// The unicast-response bit of the question class.
    pub unicast_response: bool,
}

/// A normalized DNS packet, the unit every component exchanges.
#[derive(Debug, Clone)]
pub struct DnsPacket {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authority: Vec<DnsRecord>,
    pub additional: Vec<DnsRecord>,
}

impl DnsPacket {
    pub fn query() -> Self {
        Self::with_flags(FLAGS_QUERY)
    }

    pub fn response() -> Self {
        Self::with_flags(FLAGS_RESPONSE)
    }

    fn with_flags(flags: u16) -> Self {
        Self {
            id: 0,
            flags,
            questions: Vec::new(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Serializes the packet into a fresh wire buffer.
    pub fn to_wire(&self) -> Result<Vec<u8>, MdnsError> {
        let mut mb = MessageBuilder::new_vec();

        set_header(&mut mb, self.id, self.is_response());

        let mut qb = mb.question();
        for question in &self.questions {
            let class = if question.unicast_response {
                Class::from_int(Class::IN.to_int() | CLASS_FLAG)
            } else {
                Class::IN
            };

            qb.push(Question::new(question.name.clone(), question.rtype, class))?;
        }

        let mut ab = qb.answer();
        for record in &self.answers {
            ab.push(wire_record(record)?)?;
        }

        let mut auth = ab.authority();
        for record in &self.authority {
            auth.push(wire_record(record)?)?;
        }

        let mut add = auth.additional();
        for record in &self.additional {
            add.push(wire_record(record)?)?;
        }

        Ok(add.finish())
    }
}

/// Parses a wire packet into the normalized model.
///
/// Questions outside class IN are dropped. Records of types the advertiser
/// does not model keep their name and TTL but degrade to [`Rdata::Any`],
/// which compares unequal to every published record.
pub fn parse_message(data: &[u8]) -> Result<DnsPacket, MdnsError> {
    let message = Message::from_octets(data)?;
    let header = message.header();

    let mut flags = 0u16;
    if header.qr() {
        flags |= 0x8000;
    }
    if header.aa() {
        flags |= 0x0400;
    }

    let mut packet = DnsPacket::with_flags(flags);
    packet.id = header.id();

    for question in message.question() {
        let question = question?;
        let class = question.qclass().to_int();

        if class & CLASS_MASK != Class::IN.to_int() {
            continue;
        }

        packet.questions.push(DnsQuestion {
            name: question.qname().to_name(),
            rtype: question.qtype(),
            unicast_response: class & CLASS_FLAG != 0,
        });
    }

    for record in message.answer()?.into_records::<AllRecordData<_, _>>() {
        if let Some(record) = from_parsed(&record?) {
            packet.answers.push(record);
        }
    }

    for record in message.authority()?.into_records::<AllRecordData<_, _>>() {
        if let Some(record) = from_parsed(&record?) {
            packet.authority.push(record);
        }
    }

    for record in message.additional()?.into_records::<AllRecordData<_, _>>() {
        if let Some(record) = from_parsed(&record?) {
            packet.additional.push(record);
        }
    }

    Ok(packet)
}

fn from_parsed<Octs, N>(record: &Record<N, AllRecordData<Octs, N>>) -> Option<DnsRecord>
where
    Octs: AsRef<[u8]>,
    N: ToName,
{
    let class = record.class().to_int();

    let data = if class & CLASS_MASK != Class::IN.to_int() {
        // Non-IN records can never equal anything we publish.
        Rdata::Any
    } else {
        match record.data() {
            AllRecordData::A(a) => Rdata::A(a.addr()),
            AllRecordData::Aaaa(aaaa) => Rdata::Aaaa(aaaa.addr()),
            AllRecordData::Ptr(ptr) => Rdata::Ptr(ptr.ptrdname().to_name()),
            AllRecordData::Srv(srv) => Rdata::Srv {
                priority: srv.priority(),
                weight: srv.weight(),
                port: srv.port(),
                target: srv.target().to_name(),
            },
            AllRecordData::Txt(txt) => {
                let mut bytes = Vec::new();
                for segment in txt.iter() {
                    let segment: &[u8] = segment.as_ref();
                    bytes.push(segment.len() as u8);
                    bytes.extend_from_slice(segment);
                }
                Rdata::Txt(bytes)
            }
            _ => return None,
        }
    };

    Some(DnsRecord {
        name: record.owner().to_name(),
        ttl_ms: u64::from(record.ttl().as_secs()) * 1000,
        cache_flush: class & CLASS_FLAG != 0,
        data,
    })
}

/// The composable rdata of an outgoing record.
///
/// TXT rdata is kept as raw, already length-prefixed bytes and composed
/// directly; everything else goes through the `domain` rdata types.
enum WireData<'a> {
    Plain(AllRecordData<Vec<u8>, DnsName>),
    Txt(TxtRdata<'a>),
}

impl RecordData for WireData<'_> {
    fn rtype(&self) -> Rtype {
        match self {
            Self::Plain(data) => data.rtype(),
            Self::Txt(data) => data.rtype(),
        }
    }
}

impl ComposeRecordData for WireData<'_> {
    fn rdlen(&self, compress: bool) -> Option<u16> {
        match self {
            Self::Plain(data) => data.rdlen(compress),
            Self::Txt(data) => data.rdlen(compress),
        }
    }

    fn compose_rdata<Target: Composer + ?Sized>(
        &self,
        target: &mut Target,
    ) -> Result<(), Target::AppendError> {
        match self {
            Self::Plain(data) => data.compose_rdata(target),
            Self::Txt(data) => data.compose_rdata(target),
        }
    }

    fn compose_canonical_rdata<Target: Composer + ?Sized>(
        &self,
        target: &mut Target,
    ) -> Result<(), Target::AppendError> {
        match self {
            Self::Plain(data) => data.compose_canonical_rdata(target),
            Self::Txt(data) => data.compose_canonical_rdata(target),
        }
    }
}

/// Raw TXT rdata: a sequence of length-prefixed character strings.
struct TxtRdata<'a>(&'a [u8]);

impl RecordData for TxtRdata<'_> {
    fn rtype(&self) -> Rtype {
        Rtype::TXT
    }
}

impl ComposeRecordData for TxtRdata<'_> {
    fn rdlen(&self, _compress: bool) -> Option<u16> {
        None
    }

    fn compose_rdata<Target: Composer + ?Sized>(
        &self,
        target: &mut Target,
    ) -> Result<(), Target::AppendError> {
        target.append_slice(self.0)
    }

    fn compose_canonical_rdata<Target: Composer + ?Sized>(
        &self,
        target: &mut Target,
    ) -> Result<(), Target::AppendError> {
        self.compose_rdata(target)
    }
}

fn wire_record(record: &DnsRecord) -> Result<Record<DnsName, WireData<'_>>, MdnsError> {
    let class = if record.cache_flush {
        Class::from_int(Class::IN.to_int() | CLASS_FLAG)
    } else {
        Class::IN
    };

    let data = match &record.data {
        Rdata::Ptr(target) => WireData::Plain(AllRecordData::Ptr(Ptr::new(target.clone()))),
        Rdata::Srv {
            priority,
            weight,
            port,
            target,
        } => WireData::Plain(AllRecordData::Srv(Srv::new(
            *priority,
            *weight,
            *port,
            target.clone(),
        ))),
        Rdata::Txt(bytes) => WireData::Txt(TxtRdata(bytes)),
        Rdata::A(addr) => WireData::Plain(AllRecordData::A(A::new(*addr))),
        Rdata::Aaaa(addr) => WireData::Plain(AllRecordData::Aaaa(Aaaa::new(*addr))),
        Rdata::Nsec { next_domain, types } => WireData::Plain(AllRecordData::Nsec(Nsec::new(
            next_domain.clone(),
            rtype_bitmap(types)?,
        ))),
        // ANY is a question type, never record data.
        Rdata::Any => return Err(MdnsError::InvalidMessage),
    };

    Ok(Record::new(
        record.name.clone(),
        class,
        record.wire_ttl(),
        data,
    ))
}

fn rtype_bitmap(types: &[Rtype]) -> Result<RtypeBitmap<Vec<u8>>, MdnsError> {
    let mut builder = RtypeBitmapBuilder::new_vec();

    for rtype in types {
        builder.add(*rtype).map_err(|_| MdnsError::ShortBuf)?;
    }

    Ok(builder.finalize())
}

/// Sets the header of an mDNS message builder up as a query or a response.
fn set_header<T: Composer>(mb: &mut MessageBuilder<T>, id: u16, response: bool) {
    let header = mb.header_mut();
    header.set_id(id);
    header.set_opcode(Opcode::QUERY);
    header.set_rcode(Rcode::NOERROR);

    let mut flags = Flags::new();
    flags.qr = response;
    flags.aa = response;
    header.set_flags(flags);
}

#[cfg(test)]
mod test {
    use core::net::{Ipv4Addr, Ipv6Addr};
    use core::str::FromStr;

    use super::*;

    fn name(s: &str) -> DnsName {
        DnsName::from_str(s).unwrap()
    }

    #[test]
    fn response_round_trip() {
        let mut packet = DnsPacket::response();
        packet.answers.push(DnsRecord::new(
            name("_testservice._tcp.local"),
            SERVICE_RECORD_TTL_MS,
            false,
            Rdata::Ptr(name("MyTestService._testservice._tcp.local")),
        ));
        packet.answers.push(DnsRecord::new(
            name("MyTestService._testservice._tcp.local"),
            HOST_RECORD_TTL_MS,
            true,
            Rdata::Srv {
                priority: 0,
                weight: 0,
                port: 12345,
                target: name("Host-1.local"),
            },
        ));
        packet.answers.push(DnsRecord::new(
            name("MyTestService._testservice._tcp.local"),
            SERVICE_RECORD_TTL_MS,
            true,
            Rdata::Txt(vec![0]),
        ));
        packet.answers.push(DnsRecord::new(
            name("Host-1.local"),
            HOST_RECORD_TTL_MS,
            true,
            Rdata::A(Ipv4Addr::new(192, 0, 2, 111)),
        ));
        packet.answers.push(DnsRecord::new(
            name("Host-1.local"),
            HOST_RECORD_TTL_MS,
            true,
            Rdata::Aaaa(Ipv6Addr::from_str("2001:db8::111").unwrap()),
        ));

        let wire = packet.to_wire().unwrap();
        let parsed = parse_message(&wire).unwrap();

        assert_eq!(parsed.flags, FLAGS_RESPONSE);
        assert!(parsed.is_response());
        assert!(parsed.questions.is_empty());
        assert_eq!(parsed.answers, packet.answers);
        assert!(parsed.authority.is_empty());
        assert!(parsed.additional.is_empty());
    }

    #[test]
    fn probe_query_round_trip() {
        let mut packet = DnsPacket::query();
        packet.questions.push(DnsQuestion {
            name: name("MyTestService._testservice._tcp.local"),
            rtype: Rtype::ANY,
            unicast_response: true,
        });
        packet.authority.push(DnsRecord::new(
            name("MyTestService._testservice._tcp.local"),
            HOST_RECORD_TTL_MS,
            false,
            Rdata::Srv {
                priority: 0,
                weight: 0,
                port: 12345,
                target: name("Host-1.local"),
            },
        ));

        let wire = packet.to_wire().unwrap();
        let parsed = parse_message(&wire).unwrap();

        assert_eq!(parsed.flags, FLAGS_QUERY);
        assert!(!parsed.is_response());
        assert_eq!(parsed.questions, packet.questions);
        assert_eq!(parsed.authority, packet.authority);
    }

    #[test]
    fn nsec_composes_but_is_opaque_to_the_parser() {
        let mut packet = DnsPacket::response();
        packet.additional.push(DnsRecord::new(
            name("Host-1.local"),
            HOST_RECORD_TTL_MS,
            true,
            Rdata::Nsec {
                next_domain: name("Host-1.local"),
                types: vec![Rtype::A, Rtype::AAAA],
            },
        ));

        let wire = packet.to_wire().unwrap();
        let parsed = parse_message(&wire).unwrap();

        // NSEC is compose-only; the parser drops what it does not model.
        assert!(parsed.additional.is_empty());
    }

    #[test]
    fn ttl_is_encoded_in_seconds() {
        let record = DnsRecord::new(
            name("x.local"),
            SERVICE_RECORD_TTL_MS,
            false,
            Rdata::Txt(vec![0]),
        );

        assert_eq!(record.wire_ttl(), Ttl::from_secs(4500));
    }

    #[test]
    fn question_matching() {
        let record = DnsRecord::new(
            name("MyTestService._testservice._tcp.local"),
            HOST_RECORD_TTL_MS,
            true,
            Rdata::Txt(vec![0]),
        );

        assert!(record.answers(&name("mytestservice._TESTSERVICE._tcp.local"), Rtype::TXT));
        assert!(record.answers(&name("MyTestService._testservice._tcp.local"), Rtype::ANY));
        assert!(!record.answers(&name("MyTestService._testservice._tcp.local"), Rtype::SRV));
        assert!(!record.answers(&name("Other._testservice._tcp.local"), Rtype::TXT));
    }
}
