//! Timed, cancellable repetition of precomputed packets: the generic
//! repeater plus its probing and announcing specializations.
//!
//! The repeater is an I/O-free timer arena keyed by service id. The caller
//! supplies the current time to [`PacketRepeater::poll`] and sleeps until
//! [`PacketRepeater::next_deadline`]; nothing in here reads the clock.

use embassy_time::{Duration, Instant};

use log::debug;

use crate::record::DnsPacket;
use crate::repository::{AnnouncementInfo, ProbingInfo};
use crate::{AdvertiserConfig, ServiceId};

/// The shot schedule of one repeater job.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Delay before the first shot.
    pub initial_delay: Duration,
    /// Delay between consecutive shots.
    pub interval: Duration,
    /// Total number of shots.
    pub count: usize,
    /// Double the interval after every shot (RFC 6762 §8.3 announcements).
    pub doubling: bool,
}

impl Plan {
    /// The probing schedule: `probe_count` shots, `probe_interval` apart,
    /// the first one after a random fraction of the interval.
    pub fn probe(config: &AdvertiserConfig, rand: fn(&mut [u8])) -> Self {
        let mut buf = [0; 4];
        rand(&mut buf);

        let interval_ms = config.probe_interval.as_millis();
        let delay_ms = if interval_ms == 0 {
            0
        } else {
            u64::from(u32::from_le_bytes(buf)) % interval_ms
        };

        Self {
            initial_delay: Duration::from_millis(delay_ms),
            interval: config.probe_interval,
            count: config.probe_count,
            doubling: false,
        }
    }

    /// The announcing schedule: `announce_count` shots, starting right away
    /// and doubling the interval from `announce_initial_interval`.
    pub fn announce(config: &AdvertiserConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(0),
            interval: config.announce_initial_interval,
            count: config.announce_count,
            doubling: true,
        }
    }

    /// The goodbye schedule: one shot after the exit delay, which lets
    /// several services removed together coalesce their goodbyes.
    pub fn exit(config: &AdvertiserConfig) -> Self {
        Self {
            initial_delay: config.exit_announcement_delay,
            interval: Duration::from_millis(0),
            count: 1,
            doubling: false,
        }
    }
}

/// What a [`PacketRepeater::poll`] call asks the driver to do.
#[derive(Debug)]
pub enum RepeaterEvent {
    /// Send this packet now.
    Send {
        service_id: ServiceId,
        packet: DnsPacket,
    },
    /// The job's last packet was dispatched.
    Finished { service_id: ServiceId },
}

#[derive(Debug)]
struct Job {
    service_id: ServiceId,
    packet: DnsPacket,
    next_at: Instant,
    interval: Duration,
    remaining: usize,
    doubling: bool,
}

/// A timer arena with at most one running job per service id.
#[derive(Debug, Default)]
pub struct PacketRepeater {
    jobs: Vec<Job>,
}

impl PacketRepeater {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Schedules `packet` for repetition, replacing any job already running
    /// for the same service.
    pub fn start(&mut self, service_id: ServiceId, packet: DnsPacket, plan: Plan, now: Instant) {
        self.stop(service_id);

        self.jobs.push(Job {
            service_id,
            packet,
            next_at: now + plan.initial_delay,
            interval: plan.interval,
            remaining: plan.count,
            doubling: plan.doubling,
        });
    }

    /// Cancels the job for a service. Idempotent; the job's pending shots
    /// are unscheduled before this returns.
    pub fn stop(&mut self, service_id: ServiceId) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|job| job.service_id != service_id);
        before != self.jobs.len()
    }

    pub fn is_running(&self, service_id: ServiceId) -> bool {
        self.jobs.iter().any(|job| job.service_id == service_id)
    }

    /// The earliest pending shot, if any job is running.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.jobs.iter().map(|job| job.next_at).min()
    }

    /// Emits every shot due at `now`, catching up on missed intervals.
    pub fn poll(&mut self, now: Instant) -> Vec<RepeaterEvent> {
        let mut events = Vec::new();

        let mut index = 0;
        while index < self.jobs.len() {
            let job = &mut self.jobs[index];
            let mut finished = false;

            while job.remaining > 0 && job.next_at <= now {
                debug!(
                    "Dispatching repeated packet for service {} ({} left)",
                    job.service_id,
                    job.remaining - 1
                );

                events.push(RepeaterEvent::Send {
                    service_id: job.service_id,
                    packet: job.packet.clone(),
                });

                job.remaining -= 1;
                job.next_at += job.interval;
                if job.doubling {
                    job.interval = job.interval * 2;
                }
            }

            if job.remaining == 0 {
                events.push(RepeaterEvent::Finished {
                    service_id: job.service_id,
                });
                finished = true;
            }

            if finished {
                self.jobs.swap_remove(index);
            } else {
                index += 1;
            }
        }

        events
    }
}

/// The repeater specialized for probing (RFC 6762 §8.1).
#[derive(Debug)]
pub struct Prober {
    repeater: PacketRepeater,
    config: AdvertiserConfig,
    rand: fn(&mut [u8]),
}

impl Prober {
    pub fn new(config: AdvertiserConfig, rand: fn(&mut [u8])) -> Self {
        Self {
            repeater: PacketRepeater::new(),
            config,
            rand,
        }
    }

    pub fn start(&mut self, info: &ProbingInfo, now: Instant) {
        let plan = Plan::probe(&self.config, self.rand);
        self.repeater
            .start(info.service_id, info.packet.clone(), plan, now);
    }

    pub fn stop(&mut self, service_id: ServiceId) -> bool {
        self.repeater.stop(service_id)
    }

    pub fn is_probing(&self, service_id: ServiceId) -> bool {
        self.repeater.is_running(service_id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.repeater.next_deadline()
    }

    pub fn poll(&mut self, now: Instant) -> Vec<RepeaterEvent> {
        self.repeater.poll(now)
    }
}

/// The repeater specialized for announcements and goodbyes (RFC 6762 §8.3).
#[derive(Debug)]
pub struct Announcer {
    repeater: PacketRepeater,
    config: AdvertiserConfig,
}

impl Announcer {
    pub fn new(config: AdvertiserConfig) -> Self {
        Self {
            repeater: PacketRepeater::new(),
            config,
        }
    }

    pub fn announce(&mut self, info: &AnnouncementInfo, now: Instant) {
        let plan = Plan::announce(&self.config);
        self.repeater
            .start(info.service_id, info.packet.clone(), plan, now);
    }

    pub fn announce_exit(&mut self, info: &AnnouncementInfo, now: Instant) {
        let plan = Plan::exit(&self.config);
        self.repeater
            .start(info.service_id, info.packet.clone(), plan, now);
    }

    pub fn stop(&mut self, service_id: ServiceId) -> bool {
        self.repeater.stop(service_id)
    }

    pub fn is_announcing(&self, service_id: ServiceId) -> bool {
        self.repeater.is_running(service_id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.repeater.next_deadline()
    }

    pub fn poll(&mut self, now: Instant) -> Vec<RepeaterEvent> {
        self.repeater.poll(now)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn zero_rand(buf: &mut [u8]) {
        buf.fill(0);
    }

    fn packet() -> DnsPacket {
        DnsPacket::query()
    }

    fn sends(events: &[RepeaterEvent]) -> usize {
        events
            .iter()
            .filter(|event| matches!(event, RepeaterEvent::Send { .. }))
            .count()
    }

    fn finished(events: &[RepeaterEvent]) -> bool {
        events
            .iter()
            .any(|event| matches!(event, RepeaterEvent::Finished { .. }))
    }

    #[test]
    fn probe_plan_schedule() {
        let t0 = Instant::from_millis(0);
        let mut repeater = PacketRepeater::new();
        repeater.start(1, packet(), Plan::probe(&AdvertiserConfig::new(), zero_rand), t0);

        assert_eq!(repeater.next_deadline(), Some(t0));

        let events = repeater.poll(t0);
        assert_eq!(sends(&events), 1);
        assert!(!finished(&events));
        assert_eq!(repeater.next_deadline(), Some(t0 + Duration::from_millis(250)));

        let events = repeater.poll(t0 + Duration::from_millis(250));
        assert_eq!(sends(&events), 1);

        let events = repeater.poll(t0 + Duration::from_millis(500));
        assert_eq!(sends(&events), 1);
        assert!(finished(&events));
        assert!(!repeater.is_running(1));
    }

    #[test]
    fn announce_plan_doubles_the_interval() {
        let t0 = Instant::from_millis(0);
        let mut config = AdvertiserConfig::new();
        config.announce_count = 4;

        let mut repeater = PacketRepeater::new();
        repeater.start(1, packet(), Plan::announce(&config), t0);

        let mut at = t0;
        for expected_gap in [1000u64, 2000, 4000] {
            let events = repeater.poll(at);
            assert_eq!(sends(&events), 1);
            assert_eq!(
                repeater.next_deadline(),
                Some(at + Duration::from_millis(expected_gap))
            );
            at += Duration::from_millis(expected_gap);
        }

        let events = repeater.poll(at);
        assert_eq!(sends(&events), 1);
        assert!(finished(&events));
    }

    #[test]
    fn exit_plan_is_one_delayed_shot() {
        let t0 = Instant::from_millis(0);
        let mut repeater = PacketRepeater::new();
        repeater.start(1, packet(), Plan::exit(&AdvertiserConfig::new()), t0);

        assert_eq!(repeater.next_deadline(), Some(t0 + Duration::from_millis(100)));
        assert!(repeater.poll(t0).is_empty());

        let events = repeater.poll(t0 + Duration::from_millis(100));
        assert_eq!(sends(&events), 1);
        assert!(finished(&events));
        assert_eq!(repeater.next_deadline(), None);
    }

    #[test]
    fn poll_catches_up_missed_shots() {
        let t0 = Instant::from_millis(0);
        let mut repeater = PacketRepeater::new();
        repeater.start(1, packet(), Plan::probe(&AdvertiserConfig::new(), zero_rand), t0);

        let events = repeater.poll(t0 + Duration::from_millis(10_000));
        assert_eq!(sends(&events), 3);
        assert!(finished(&events));
    }

    #[test]
    fn stop_is_synchronous_and_idempotent() {
        let t0 = Instant::from_millis(0);
        let mut repeater = PacketRepeater::new();
        repeater.start(1, packet(), Plan::probe(&AdvertiserConfig::new(), zero_rand), t0);

        assert!(repeater.stop(1));
        assert!(!repeater.stop(1));
        assert_eq!(repeater.next_deadline(), None);
        assert!(repeater.poll(t0 + Duration::from_millis(10_000)).is_empty());
    }

    #[test]
    fn restart_replaces_the_running_job() {
        let t0 = Instant::from_millis(0);
        let mut repeater = PacketRepeater::new();
        repeater.start(1, packet(), Plan::probe(&AdvertiserConfig::new(), zero_rand), t0);
        repeater.poll(t0);

        // Restarting resets the shot counter.
        repeater.start(1, packet(), Plan::probe(&AdvertiserConfig::new(), zero_rand), t0);

        let events = repeater.poll(t0 + Duration::from_millis(10_000));
        assert_eq!(sends(&events), 3);
    }

    #[test]
    fn jobs_for_different_services_run_independently() {
        let t0 = Instant::from_millis(0);
        let mut repeater = PacketRepeater::new();
        repeater.start(1, packet(), Plan::probe(&AdvertiserConfig::new(), zero_rand), t0);
        repeater.start(2, packet(), Plan::exit(&AdvertiserConfig::new()), t0);

        let events = repeater.poll(t0);
        assert_eq!(sends(&events), 1);

        repeater.stop(1);
        assert!(repeater.is_running(2));

        let events = repeater.poll(t0 + Duration::from_millis(100));
        assert_eq!(sends(&events), 1);
        assert!(finished(&events));
    }

    #[test]
    fn random_probe_delay_stays_within_the_interval() {
        fn max_rand(buf: &mut [u8]) {
            buf.fill(0xff);
        }

        let plan = Plan::probe(&AdvertiserConfig::new(), max_rand);
        assert!(plan.initial_delay < Duration::from_millis(250));
    }
}
