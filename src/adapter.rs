//! Adapter protocol detection and the adapter control contract.

use embedded_hal_async::delay::DelayNs;

use crate::events::ChargerEvents;
use crate::types::{AdapterSupportMode, Protocol, ProtocolMask};

/// Transport failures are retried this many times per protocol before it is given up.
pub const ADAPTER_DETECT_RETRY_TIMES: u8 = 3;

/// Pause after a soft reset before pinging again.
pub const ADAPTER_RESET_DELAY_MS: u32 = 20;

/// Outcome of a successful protocol handshake attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Ping {
    /// The adapter speaks the protocol and reports the direct charge modes it supports
    Supported(AdapterSupportMode),
    /// The adapter does not speak the protocol. This is a normal outcome, not an error.
    Unsupported,
}

/// A transport failure during adapter communication, tagged with the side that failed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum PingError<E> {
    /// The adapter did not answer correctly; recover with an adapter soft reset
    Adapter(E),
    /// The local protocol master failed; recover with a master soft reset
    Master(E),
}

/// Adapter protocol, control and telemetry operations.
///
/// Voltages are in mV, currents in mA and temperatures in °C.
#[allow(async_fn_in_trait)]
pub trait AdapterOps {
    /// Transport error
    type Error;

    /// Run the handshake for `protocol`.
    async fn ping(&mut self, protocol: Protocol) -> Result<Ping, PingError<Self::Error>>;

    /// Soft reset the adapter side of `protocol`.
    async fn reset_adapter(&mut self, protocol: Protocol) -> Result<(), Self::Error>;

    /// Soft reset the local protocol master for `protocol`.
    async fn reset_protocol_master(&mut self, protocol: Protocol) -> Result<(), Self::Error>;

    /// Request an output voltage.
    async fn set_output_voltage(&mut self, mv: i32) -> Result<(), Self::Error>;

    /// Request an output current limit.
    async fn set_output_current(&mut self, ma: i32) -> Result<(), Self::Error>;

    /// Measured output voltage
    async fn get_output_voltage(&mut self) -> Result<i32, Self::Error>;

    /// Measured output current
    async fn get_output_current(&mut self) -> Result<i32, Self::Error>;

    /// Maximum output current the adapter advertises
    async fn get_max_current(&mut self) -> Result<i32, Self::Error>;

    /// Internal adapter temperature
    async fn get_temp(&mut self) -> Result<i32, Self::Error>;

    /// Return the adapter to its default (non direct charge) output.
    async fn set_default(&mut self) -> Result<(), Self::Error>;
}

/// One row of the detection priority table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct PriorityEntry {
    /// Protocol to probe
    pub protocol: Protocol,
    /// When the probe succeeds, stop probing lower priority rows
    pub exclusive: bool,
}

impl PriorityEntry {
    /// A row whose success ends detection
    pub const fn exclusive(protocol: Protocol) -> Self {
        PriorityEntry {
            protocol,
            exclusive: true,
        }
    }

    /// A row that can coexist with lower priority protocols
    pub const fn compatible(protocol: Protocol) -> Self {
        PriorityEntry {
            protocol,
            exclusive: false,
        }
    }
}

/// Detection tunables.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct DetectConfig {
    /// Maximum ping attempts per protocol on transport failure
    pub retry_count: u8,
    /// Delay after a soft reset
    pub reset_delay_ms: u32,
}

impl Default for DetectConfig {
    fn default() -> Self {
        DetectConfig {
            retry_count: ADAPTER_DETECT_RETRY_TIMES,
            reset_delay_ms: ADAPTER_RESET_DELAY_MS,
        }
    }
}

/// The outcome of one detection cycle. Valid until the cable is removed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct AdapterNegotiationResult {
    /// Every protocol the priority table asked about
    pub supported_protocol_mask: ProtocolMask,
    /// Protocols confirmed live during this cycle
    pub runtime_protocol_mask: ProtocolMask,
    /// Direct charge modes reported by the confirmed protocols
    pub support_mode: AdapterSupportMode,
    /// Highest priority confirmed protocol
    pub selected_protocol: Protocol,
}

/// Why detection produced no result.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum DetectError {
    /// The cable was removed while detecting
    PluggedOut,
    /// No protocol in the table was confirmed
    NoProtocol,
    /// The priority table is empty
    EmptyTable,
}

enum Probe {
    Supported(AdapterSupportMode),
    Unsupported,
    GaveUp,
}

/// Probes an attached adapter for fast charge protocols.
pub struct AdapterDetector<'a, A> {
    adapter: &'a mut A,
    events: &'a ChargerEvents,
    config: DetectConfig,
}

impl<'a, A: AdapterOps> AdapterDetector<'a, A> {
    /// Create a new `AdapterDetector`
    pub fn new(adapter: &'a mut A, events: &'a ChargerEvents, config: DetectConfig) -> Self {
        AdapterDetector {
            adapter,
            events,
            config,
        }
    }

    /// Probe every protocol in `table`, highest priority first.
    ///
    /// A confirmed exclusive protocol ends detection. A confirmed compatible protocol is
    /// recorded and probing continues with the next row. Cable removal aborts at the next
    /// retry boundary.
    pub async fn detect_protocol<D: DelayNs>(
        &mut self,
        table: &[PriorityEntry],
        delay: &mut D,
    ) -> Result<AdapterNegotiationResult, DetectError> {
        if table.is_empty() {
            return Err(DetectError::EmptyTable);
        }

        let mut supported = ProtocolMask::new();
        for entry in table {
            supported.insert(entry.protocol);
        }

        let mut runtime = ProtocolMask::new();
        let mut support_mode = AdapterSupportMode::new();
        let mut selected = None;

        for entry in table {
            match self.probe(entry.protocol, delay).await? {
                Probe::Supported(mode) => {
                    info!("adapter supports {}, mode {}", entry.protocol, mode);
                    runtime.insert(entry.protocol);
                    support_mode = support_mode.union(&mode);
                    selected.get_or_insert(entry.protocol);
                    if entry.exclusive {
                        break;
                    }
                }
                Probe::Unsupported => debug!("adapter does not support {}", entry.protocol),
                Probe::GaveUp => warn!("giving up on {} after transport errors", entry.protocol),
            }
        }

        match selected {
            Some(selected_protocol) => Ok(AdapterNegotiationResult {
                supported_protocol_mask: supported,
                runtime_protocol_mask: runtime,
                support_mode,
                selected_protocol,
            }),
            None => Err(DetectError::NoProtocol),
        }
    }

    async fn probe<D: DelayNs>(
        &mut self,
        protocol: Protocol,
        delay: &mut D,
    ) -> Result<Probe, DetectError> {
        for attempt in 0..self.config.retry_count.max(1) {
            self.check_plugged(protocol)?;

            match self.adapter.ping(protocol).await {
                Ok(Ping::Supported(mode)) => return Ok(Probe::Supported(mode)),
                Ok(Ping::Unsupported) => return Ok(Probe::Unsupported),
                Err(PingError::Adapter(_)) => {
                    warn!("{} ping failed on adapter, attempt {}", protocol, attempt);
                    if self.is_last(attempt) {
                        break;
                    }
                    self.check_plugged(protocol)?;
                    if self.adapter.reset_adapter(protocol).await.is_err() {
                        error!("soft reset adapter failed");
                    }
                }
                Err(PingError::Master(_)) => {
                    warn!("{} ping failed on master, attempt {}", protocol, attempt);
                    if self.is_last(attempt) {
                        break;
                    }
                    self.check_plugged(protocol)?;
                    if self.adapter.reset_protocol_master(protocol).await.is_err() {
                        error!("soft reset master failed");
                    }
                }
            }
            delay.delay_ms(self.config.reset_delay_ms).await;
        }
        Ok(Probe::GaveUp)
    }

    fn check_plugged(&self, protocol: Protocol) -> Result<(), DetectError> {
        if self.events.plugged_out() {
            info!("adapter removed during detection of {}", protocol);
            return Err(DetectError::PluggedOut);
        }
        Ok(())
    }

    fn is_last(&self, attempt: u8) -> bool {
        attempt + 1 >= self.config.retry_count
    }
}
