use crate::wire::ByteOrder;
use anyhow::bail;
use std::time::Duration;

pub struct TargetConfig {
    /// The byte order control traffic is encoded in. IPbus firmware exists in both
    ///  flavors; status traffic is big-endian either way, and replies are decoded
    ///  by their self-describing headers, so a mismatch here shows up as the device
    ///  ignoring requests rather than as garbled data.
    pub byte_order: ByteOrder,

    /// Upper bound on the number of unacknowledged packets on the wire. The
    ///  effective window is the smaller of this and the number of response buffers
    ///  the device reports, since a device overrun loses replies silently.
    pub max_flight: usize,

    /// How long the oldest unacknowledged packet may stay unanswered before loss
    ///  recovery starts. Recovery queries the device's status to decide whether the
    ///  request or the reply got lost, so this should comfortably exceed the round
    ///  trip time to avoid spurious status traffic.
    pub flight_timeout: Duration,

    /// reply deadline for a single status query during recovery
    pub status_timeout: Duration,

    /// how many times a status query is repeated before the target gives up
    pub status_attempts: usize,

    /// interval between throughput log lines; packets and transactions are counted
    ///  per interval
    pub report_interval: Duration,

    /// Number of sealed packets that may queue up ahead of the engine before
    ///  submission exerts backpressure on callers.
    pub queued_capacity: usize,

    /// Delay after which pending operations are sent off even though the packet
    ///  under construction has room left and nobody called dispatch. `None` turns
    ///  this off, leaving it to explicit dispatch calls and full packets.
    pub flush_delay: Option<Duration>,
}

impl TargetConfig {
    pub fn default_big_endian() -> TargetConfig {
        TargetConfig {
            byte_order: ByteOrder::Big,
            max_flight: 4,
            flight_timeout: Duration::from_secs(1),
            status_timeout: Duration::from_millis(250),
            status_attempts: 3,
            report_interval: Duration::from_secs(10),
            queued_capacity: 64,
            flush_delay: Some(Duration::from_millis(1)),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_flight == 0 {
            bail!("max_flight must be at least 1");
        }
        if self.flight_timeout.is_zero() {
            bail!("flight_timeout must be non-zero");
        }
        if self.status_timeout.is_zero() {
            bail!("status_timeout must be non-zero");
        }
        if self.status_attempts == 0 {
            bail!("status_attempts must be at least 1");
        }
        if self.report_interval.is_zero() {
            bail!("report_interval must be non-zero");
        }
        if self.queued_capacity == 0 {
            bail!("queued_capacity must be at least 1");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_config_default_is_valid() {
        TargetConfig::default_big_endian().validate().unwrap();
    }

    #[rstest]
    #[case::max_flight(TargetConfig { max_flight: 0, ..TargetConfig::default_big_endian() })]
    #[case::flight_timeout(TargetConfig { flight_timeout: Duration::ZERO, ..TargetConfig::default_big_endian() })]
    #[case::status_timeout(TargetConfig { status_timeout: Duration::ZERO, ..TargetConfig::default_big_endian() })]
    #[case::status_attempts(TargetConfig { status_attempts: 0, ..TargetConfig::default_big_endian() })]
    #[case::report_interval(TargetConfig { report_interval: Duration::ZERO, ..TargetConfig::default_big_endian() })]
    #[case::queued_capacity(TargetConfig { queued_capacity: 0, ..TargetConfig::default_big_endian() })]
    fn test_config_validate_rejects(#[case] config: TargetConfig) {
        assert!(config.validate().is_err());
    }
}
