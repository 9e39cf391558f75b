use tokio::time::{Duration, Instant};

/// Heartbeat liveness for a single connection
#[derive(Debug)]
pub struct HeartbeatHealth {
    /// Time of last heartbeat sent
    last_sent: Option<Instant>,

    /// Whether an ack arrived since the last heartbeat was sent
    ack_received: bool,

    /// Round trip of the last acknowledged heartbeat
    latency: Option<Duration>,
}

impl Default for HeartbeatHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatHealth {
    pub fn new() -> Self {
        Self {
            last_sent: None,
            ack_received: true,
            latency: None,
        }
    }

    /// Reset for a freshly greeted connection; the first timer tick must send
    /// rather than time out.
    pub fn reset(&mut self) {
        self.ack_received = true;
        self.last_sent = None;
    }

    /// Record a heartbeat sent by the timer (an ack is now outstanding)
    pub fn record_sent(&mut self) {
        self.last_sent = Some(Instant::now());
        self.ack_received = false;
    }

    /// Record a heartbeat sent because the server asked for one.
    ///
    /// Only the send time moves; the outstanding-ack flag is left alone.
    pub fn record_requested_sent(&mut self) {
        self.last_sent = Some(Instant::now());
    }

    /// Record an ack and return the resulting latency
    pub fn record_ack(&mut self) -> Option<Duration> {
        self.ack_received = true;
        self.latency = self.last_sent.map(|sent| sent.elapsed());
        self.latency
    }

    /// True if the previous heartbeat is still unacknowledged
    pub fn is_ack_overdue(&self) -> bool {
        !self.ack_received
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn clear_latency(&mut self) {
        self.latency = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let health = HeartbeatHealth::new();
        assert!(!health.is_ack_overdue());
        assert!(health.latency().is_none());
    }

    #[test]
    fn test_heartbeat_ack_cycle() {
        let mut health = HeartbeatHealth::new();

        health.record_sent();
        assert!(health.is_ack_overdue());

        let latency = health.record_ack();
        assert!(latency.is_some());
        assert!(!health.is_ack_overdue());
    }

    #[test]
    fn test_requested_heartbeat_keeps_ack_flag() {
        let mut health = HeartbeatHealth::new();
        health.record_requested_sent();
        assert!(!health.is_ack_overdue());

        health.record_sent();
        health.record_requested_sent();
        assert!(health.is_ack_overdue());
    }

    #[tokio::test]
    async fn test_latency_measures_round_trip() {
        let mut health = HeartbeatHealth::new();
        health.record_sent();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let latency = health.record_ack().unwrap();
        assert!(latency >= Duration::from_millis(20));

        health.clear_latency();
        assert!(health.latency().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forgets_previous_socket() {
        let mut health = HeartbeatHealth::new();
        health.record_sent();
        tokio::time::advance(Duration::from_secs(30)).await;

        // New socket greeted before the old heartbeat was acked
        health.reset();
        assert!(!health.is_ack_overdue());
        assert!(health.record_ack().is_none());

        health.record_sent();
        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(health.record_ack(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_ack_without_send_has_no_latency() {
        let mut health = HeartbeatHealth::new();
        assert!(health.record_ack().is_none());
    }
}
