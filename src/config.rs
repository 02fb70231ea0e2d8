//! Configuration types for pacerpc.

/// RPC endpoint configuration.
///
/// Controls request multiplexing, credit-based flow control, session
/// management timing, and transmission pacing.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Request window size (concurrent requests per session, power of two).
    /// Default: 8
    pub req_window: usize,
    /// Session credits: data packets a session may have in flight.
    /// Default: 32
    pub session_credits: usize,
    /// Maximum number of sessions per endpoint.
    /// Default: 256
    pub max_sessions: usize,
    /// Maximum message size in bytes.
    /// Default: 1 MiB
    pub max_msg_size: usize,
    /// Handshake retransmission interval in milliseconds.
    /// Default: 20
    pub sm_retrans_ms: u64,
    /// Handshake give-up cap in milliseconds.
    /// Default: 5000
    pub sm_timeout_ms: u64,
    /// Pace data packets through the timing wheel.
    /// Default: false
    pub enable_pacing: bool,
    /// Width of one wheel slot in microseconds.
    /// Default: 0.5
    pub wslot_width_us: f64,
    /// Minimum supported pacing rate in Gbps; sizes the wheel horizon.
    /// Default: 1.0
    pub min_rate_gbps: f64,
    /// Link rate in Gbps; the congestion controller's starting rate.
    /// Default: 25.0
    pub link_rate_gbps: f64,
    /// Number of background worker threads for this endpoint.
    /// Default: 0
    pub num_bg_threads: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            req_window: 8,
            session_credits: 32,
            max_sessions: 256,
            max_msg_size: 1 << 20,
            sm_retrans_ms: 20,
            sm_timeout_ms: 5000,
            enable_pacing: false,
            wslot_width_us: 0.5,
            min_rate_gbps: 1.0,
            link_rate_gbps: 25.0,
            num_bg_threads: 0,
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request window size. Must be a power of two.
    pub fn with_req_window(mut self, req_window: usize) -> Self {
        assert!(req_window.is_power_of_two());
        self.req_window = req_window;
        self
    }

    /// Set the session credits.
    pub fn with_session_credits(mut self, session_credits: usize) -> Self {
        self.session_credits = session_credits;
        self
    }

    /// Set the maximum number of sessions.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the maximum message size.
    pub fn with_max_msg_size(mut self, max_msg_size: usize) -> Self {
        self.max_msg_size = max_msg_size;
        self
    }

    /// Set the handshake retransmission interval.
    pub fn with_sm_retrans_ms(mut self, sm_retrans_ms: u64) -> Self {
        self.sm_retrans_ms = sm_retrans_ms;
        self
    }

    /// Set the handshake give-up cap.
    pub fn with_sm_timeout_ms(mut self, sm_timeout_ms: u64) -> Self {
        self.sm_timeout_ms = sm_timeout_ms;
        self
    }

    /// Enable or disable pacing.
    pub fn with_pacing(mut self, enable_pacing: bool) -> Self {
        self.enable_pacing = enable_pacing;
        self
    }

    /// Set the wheel slot width in microseconds.
    pub fn with_wslot_width_us(mut self, wslot_width_us: f64) -> Self {
        self.wslot_width_us = wslot_width_us;
        self
    }

    /// Set the number of background worker threads.
    pub fn with_bg_threads(mut self, num_bg_threads: usize) -> Self {
        self.num_bg_threads = num_bg_threads;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = RpcConfig::default()
            .with_req_window(16)
            .with_session_credits(64)
            .with_sm_retrans_ms(50)
            .with_pacing(true)
            .with_bg_threads(2);

        assert_eq!(config.req_window, 16);
        assert_eq!(config.session_credits, 64);
        assert_eq!(config.sm_retrans_ms, 50);
        assert!(config.enable_pacing);
        assert_eq!(config.num_bg_threads, 2);
    }

    #[test]
    #[should_panic]
    fn test_window_must_be_power_of_two() {
        let _ = RpcConfig::default().with_req_window(6);
    }
}
