/// Gateway-level configuration, passed to each stream at construction.
///
/// These were process-global toggles in earlier designs; scoping them to the
/// stream keeps tests hermetic and avoids mutable global state.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Permit webhook hosts that resolve to loopback, link-local, private
    /// (RFC1918) or unique-local addresses. Off by default: the guard exists
    /// to stop server-side request forgery into internal networks.
    pub allow_private_ips: bool,

    /// Tick interval for the upstream log feeder. The delivery engine does
    /// not consume this directly; it is carried here so feeder and engine
    /// share one configuration object.
    pub polling_interval_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            allow_private_ips: false,
            polling_interval_ms: 1000,
        }
    }
}
