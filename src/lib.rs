#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

//! An embedded async control engine for direct (charge-pump) fast charging.
//!
//! The crate drives one charging attempt from the moment a fast-charge adapter is
//! attached: it negotiates a protocol with the adapter ([`AdapterDetector`]), picks a
//! working mode shared by the adapter and the registered charge-pump ICs, and then runs a
//! [`ChargeSession`] from three periodic ticks:
//!
//! - the control tick switches between one and two ICs and regulates the adapter output,
//! - the threshold tick walks the stage ladder and derives the current limits,
//! - the watchdog tick keeps the IC watchdogs fed.
//!
//! Hardware is reached through the [`IcOps`], [`AdapterOps`], [`BatteryOps`] and
//! [`DiagnosticSink`] traits. Faults are collected in a bounded [`FaultLog`] and handed to
//! the sink when the session is torn down.

// must come first, the logging macros are textually scoped
mod fmt;

pub mod adapter;
pub mod battery;
pub mod events;
pub mod fault;
pub mod ic;
pub mod path_switch;
pub mod regulation;
pub mod session;
pub mod stage;
pub mod types;

#[cfg(test)]
mod testing;

pub use adapter::{
    AdapterDetector, AdapterNegotiationResult, AdapterOps, DetectConfig, DetectError, Ping,
    PingError, PriorityEntry,
};
pub use battery::{BatteryOps, SohLimits};
pub use events::ChargerEvents;
pub use fault::{DiagnosticSink, Fault, FaultDomain, FaultLog, FaultLogError, FaultRecord};
pub use ic::{IcError, IcManager, IcOps, IcResult, IcResultExt, RegisterError};
pub use path_switch::{PathState, PathSwitch, PathSwitchConfig, SwitchOutcome};
pub use regulation::{Adjustment, RegulationConfig, Regulator, Telemetry};
pub use session::{
    run_control_loop, run_threshold_loop, run_watchdog_loop, ChargeInfo, ChargeSession,
    SessionConfig, SessionParts, SessionState, StartError, Tick,
};
pub use stage::{ChargeParams, StageLadder, TempBand, VoltPara};
pub use types::{
    select_working_mode, AdapterSupportMode, FaultFlags, IcHandle, IcSlot, IcStatus,
    IcTopology, Protocol, ProtocolMask, WorkingMode,
};
