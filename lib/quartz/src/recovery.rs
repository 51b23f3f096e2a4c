//! Loss-recovery and congestion-control collaborator.
//!
//! The connection core only calls the named entry points below; the arithmetic is deliberately
//! self-contained so it can be swapped out without touching the pipelines. RTT estimation
//! follows the standard srtt/rttvar filter, the congestion controller is plain slow start plus
//! congestion avoidance.

use std::time::{Duration, Instant};

pub const K_INITIAL_RTT: Duration = Duration::from_millis(100);
pub const K_GRANULARITY: Duration = Duration::from_millis(1);
const K_INITIAL_WINDOW: u64 = 10 * 1252;
const K_MINIMUM_WINDOW: u64 = 2 * 1252;
const K_LOSS_REDUCTION_DIVISOR: u64 = 2;
/// Packet reordering threshold before a gap declares loss.
pub const K_REORDERING_THRESHOLD: u64 = 3;

pub struct Recovery {
    pub cwnd: u64,
    pub ssthresh: u64,
    pub in_flight: u64,

    pub srtt: Duration,
    pub rttvar: Duration,
    pub min_rtt: Duration,
    pub latest_rtt: Duration,

    pub pto_count: u32,
}

impl Recovery {
    pub fn new() -> Recovery {
        Recovery {
            cwnd: K_INITIAL_WINDOW,
            ssthresh: u64::max_value(),
            in_flight: 0,
            srtt: Duration::from_secs(0),
            rttvar: Duration::from_secs(0),
            min_rtt: Duration::from_secs(u64::max_value() / 2),
            latest_rtt: Duration::from_secs(0),
            pto_count: 0,
        }
    }

    /// Reset for a version-negotiation or retry restart.
    pub fn init_rec(&mut self) {
        *self = Recovery::new();
    }

    #[inline]
    pub fn has_wnd(&self, mtu: usize) -> bool {
        self.in_flight + mtu as u64 <= self.cwnd
    }

    /// Smoothed RTT, substituting the default before the first sample.
    #[inline]
    pub fn srtt_or_default(&self) -> Duration {
        if self.srtt == Duration::from_secs(0) {
            K_INITIAL_RTT
        } else {
            self.srtt
        }
    }

    /// Closing/draining period: `3 * srtt + 4 * rttvar`.
    pub fn drain_period(&self) -> Duration {
        3 * self.srtt_or_default() + 4 * self.rttvar
    }

    /// Time after which an older sent packet is declared lost: 9/8 of the latest RTT estimate.
    pub fn loss_delay(&self) -> Duration {
        let rtt = std::cmp::max(self.srtt_or_default(), self.latest_rtt);
        std::cmp::max(rtt + rtt / 8, K_GRANULARITY)
    }

    /// Probe timeout with exponential backoff.
    pub fn pto(&self) -> Duration {
        let base = self.srtt_or_default() + std::cmp::max(4 * self.rttvar, K_GRANULARITY);
        base * 2u32.saturating_pow(self.pto_count)
    }

    pub fn on_pkt_sent(&mut self, tx_len: usize, ack_eliciting: bool) {
        if ack_eliciting {
            self.in_flight += tx_len as u64;
        }
    }

    /// First ACK callback: called once per ACK frame for the largest newly acked packet, with
    /// the peer's decoded ACK delay. Updates the RTT estimate.
    pub fn on_ack_received_1(&mut self, sent_t: Option<Instant>, ack_delay: Duration, now: Instant) {
        let sent_t = match sent_t {
            Some(t) => t,
            None => return,
        };

        self.latest_rtt = now.saturating_duration_since(sent_t);
        if self.latest_rtt < self.min_rtt {
            self.min_rtt = self.latest_rtt;
        }

        // only subtract the peer's delay when it leaves the sample above the minimum
        let mut adjusted = self.latest_rtt;
        if adjusted > self.min_rtt + ack_delay {
            adjusted -= ack_delay;
        }

        if self.srtt == Duration::from_secs(0) {
            self.srtt = adjusted;
            self.rttvar = adjusted / 2;
        } else {
            let delta = if self.srtt > adjusted {
                self.srtt - adjusted
            } else {
                adjusted - self.srtt
            };
            self.rttvar = (3 * self.rttvar + delta) / 4;
            self.srtt = (7 * self.srtt + adjusted) / 8;
        }

        self.pto_count = 0;
    }

    /// Per-packet ACK callback.
    pub fn on_pkt_acked(&mut self, tx_len: usize) {
        let bytes = tx_len as u64;
        self.in_flight = self.in_flight.saturating_sub(bytes);

        if self.cwnd < self.ssthresh {
            // slow start
            self.cwnd += bytes;
        } else {
            // congestion avoidance
            self.cwnd += 1252 * bytes / self.cwnd;
        }
    }

    /// Second ACK callback: called once per ACK frame after all packets were processed, with
    /// the smallest newly acked number.
    pub fn on_ack_received_2(&mut self, _sm_new_acked: Option<u64>) {
        // loss detection is re-armed by the caller based on the remaining sent packets
    }

    /// A packet was declared lost; shrink the window once per loss event.
    pub fn on_pkt_lost(&mut self, tx_len: usize, new_loss_event: bool) {
        self.in_flight = self.in_flight.saturating_sub(tx_len as u64);

        if new_loss_event {
            self.cwnd = std::cmp::max(self.cwnd / K_LOSS_REDUCTION_DIVISOR, K_MINIMUM_WINDOW);
            self.ssthresh = self.cwnd;
        }
    }

    /// Loss-detection timer fired.
    pub fn on_ld_alarm(&mut self) {
        self.pto_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_window_allows_sending() {
        let rec = Recovery::new();
        assert!(rec.has_wnd(1252));
    }

    #[test]
    fn test_in_flight_tracks_sent_and_acked() {
        let mut rec = Recovery::new();
        rec.on_pkt_sent(1000, true);
        rec.on_pkt_sent(500, false); // ACK-only, not counted
        assert_eq!(rec.in_flight, 1000);

        rec.on_pkt_acked(1000);
        assert_eq!(rec.in_flight, 0);
    }

    #[test]
    fn test_slow_start_grows_cwnd() {
        let mut rec = Recovery::new();
        let before = rec.cwnd;
        rec.on_pkt_sent(1252, true);
        rec.on_pkt_acked(1252);
        assert_eq!(rec.cwnd, before + 1252);
    }

    #[test]
    fn test_loss_halves_cwnd_once_per_event() {
        let mut rec = Recovery::new();
        let before = rec.cwnd;

        rec.on_pkt_sent(1252, true);
        rec.on_pkt_sent(1252, true);
        rec.on_pkt_lost(1252, true);
        rec.on_pkt_lost(1252, false);

        assert_eq!(rec.cwnd, before / 2);
        assert_eq!(rec.ssthresh, before / 2);
        assert_eq!(rec.in_flight, 0);
    }

    #[test]
    fn test_rtt_filter_first_and_subsequent_samples() {
        let mut rec = Recovery::new();
        let now = Instant::now();
        let sent = now - Duration::from_millis(80);

        rec.on_ack_received_1(Some(sent), Duration::from_millis(0), now);
        assert!(rec.srtt >= Duration::from_millis(79));
        assert_eq!(rec.rttvar, rec.srtt / 2);

        let srtt_before = rec.srtt;
        let sent = now - Duration::from_millis(40);
        rec.on_ack_received_1(Some(sent), Duration::from_millis(0), now);
        assert!(rec.srtt < srtt_before);
    }

    #[test]
    fn test_drain_period_uses_default_rtt_without_samples() {
        let rec = Recovery::new();
        assert_eq!(rec.drain_period(), 3 * K_INITIAL_RTT);
    }

    #[test]
    fn test_pto_backoff() {
        let mut rec = Recovery::new();
        let base = rec.pto();
        rec.on_ld_alarm();
        assert_eq!(rec.pto(), base * 2);
        rec.on_ld_alarm();
        assert_eq!(rec.pto(), base * 4);
    }
}
