//! A direct charge session and the periodic ticks that drive it.
//!
//! A session is started once a protocol has been negotiated. Three independent ticks then
//! run against it: the control tick (path switching, regulation, termination), the slower
//! threshold tick (stage ladder and limits) and the watchdog tick. Every stop condition,
//! whichever tick sees it, ends in the same idempotent teardown.

use core::fmt::{Arguments, Write};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::delay::DelayNs;
use heapless::{String, Vec};

use crate::adapter::{AdapterNegotiationResult, AdapterOps, DetectConfig};
use crate::battery::BatteryOps;
use crate::events::ChargerEvents;
use crate::fault::{
    AdapterFault, BatteryFault, ChargingFault, DiagnosticSink, Fault, FaultDomain, FaultLog,
    FaultRecord, IcFault,
};
use crate::ic::{IcError, IcManager, IcOps, IcResultExt};
use crate::path_switch::{MultiFailure, PathState, PathSwitch, PathSwitchConfig, SwitchOutcome};
use crate::regulation::{Adjustment, OverTemp, RegulationConfig, Regulator, Telemetry};
use crate::stage::{
    compensation_mv, ChargeParams, LadderError, ParamInputs, StageLadder, TempBand, VoltPara,
    DC_TEMP_LEVEL, DC_VOLT_LEVEL,
};
use crate::types::{
    select_working_mode, AdapterSupportMode, FaultFlags, IcHandle, IcSlot, IcTopology,
    Protocol, WorkingMode,
};

/// Control tick period, ms
pub const DC_CONTROL_INTERVAL_MS: u32 = 50;
/// Threshold tick period, ms
pub const DC_THRESHOLD_INTERVAL_MS: u32 = 500;
/// Watchdog tick period, ms
pub const KICK_WATCHDOG_TIME: u32 = 1000;
/// IC watchdog timeout armed at session start, ms
pub const WATCHDOG_TIMEOUT: u32 = 2000;
/// Adapter over-temperature stops per insertion before a dedicated report is sent
pub const ADP_OTP_CNT: u8 = 3;
/// Battery current ceiling while only one IC is active, mA
pub const DC_SINGLEIC_CURRENT_LIMIT: i32 = 8000;
/// Adapter current below which the battery current is considered abnormal, mA
pub const DC_IBAT_ABNORMAL_TH: i32 = 200;
/// Threshold ticks the adapter current may stay abnormal
pub const IBAT_ABNORMAL_MAX_CNT: u8 = 10;
/// Battery and adapter reads are attempted this many times before the session stops
pub const DC_READ_RETRY_TIMES: usize = 3;

// Retries a battery or adapter read, up to `DC_READ_RETRY_TIMES` attempts in total.
macro_rules! retry_read {
    ($op:expr) => {{
        let mut attempt = 0;
        loop {
            match $op.await {
                Ok(value) => break Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= DC_READ_RETRY_TIMES {
                        break Err(e);
                    }
                    trace!("telemetry read failed, retry {}", attempt);
                }
            }
        }
    }};
}

const SLOTS: [IcSlot; 2] = [IcSlot::Main, IcSlot::Aux];

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Modes this platform can run. Intersected with the registered main ICs.
    pub local_modes: AdapterSupportMode,
    /// Stage ladder, lowest voltage first
    pub ladder: Vec<VoltPara, DC_VOLT_LEVEL>,
    /// Sub-stages skipped by stage selection
    pub jump_stages: Vec<usize, { 2 * DC_VOLT_LEVEL }>,
    /// Force the second CC stage after this long in the first CC/CV pair
    pub first_cc_limit_ms: Option<u32>,
    /// Battery temperature bands
    pub temp_bands: Vec<TempBand, DC_TEMP_LEVEL>,
    /// Charge path resistance for IR compensation, mΩ
    pub compensate_r_mohm: i32,
    /// Battery current ceiling for a single IC, mA
    pub single_ic_limit_ma: i32,
    /// Adapter current floor for the abnormal current check, mA
    pub ibat_abnormal_th_ma: i32,
    /// End the session as complete after this much charging time
    pub charge_time_limit_ms: Option<u32>,
    /// Control tick period
    pub control_interval_ms: u32,
    /// Threshold tick period
    pub threshold_interval_ms: u32,
    /// Watchdog tick period
    pub watchdog_kick_ms: u32,
    /// IC watchdog timeout
    pub watchdog_timeout_ms: u32,
    /// Adapter detection
    pub detect: DetectConfig,
    /// Path switching
    pub path_switch: PathSwitchConfig,
    /// Regulation
    pub regulation: RegulationConfig,
}

const DEFAULT_TEMP_BANDS: [TempBand; 3] = [
    TempBand {
        temp_min: 10,
        temp_max: 15,
        cur_max: 2000,
    },
    TempBand {
        temp_min: 15,
        temp_max: 40,
        cur_max: DC_SINGLEIC_CURRENT_LIMIT * 2,
    },
    TempBand {
        temp_min: 40,
        temp_max: 45,
        cur_max: 4000,
    },
];

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            local_modes: AdapterSupportMode::from_modes(&WorkingMode::ALL),
            ladder: Vec::new(),
            jump_stages: Vec::new(),
            first_cc_limit_ms: None,
            temp_bands: Vec::from_slice(&DEFAULT_TEMP_BANDS).unwrap_or_default(),
            compensate_r_mohm: 0,
            single_ic_limit_ma: DC_SINGLEIC_CURRENT_LIMIT,
            ibat_abnormal_th_ma: DC_IBAT_ABNORMAL_TH,
            charge_time_limit_ms: None,
            control_interval_ms: DC_CONTROL_INTERVAL_MS,
            threshold_interval_ms: DC_THRESHOLD_INTERVAL_MS,
            watchdog_kick_ms: KICK_WATCHDOG_TIME,
            watchdog_timeout_ms: WATCHDOG_TIMEOUT,
            detect: DetectConfig::default(),
            path_switch: PathSwitchConfig::default(),
            regulation: RegulationConfig::default(),
        }
    }
}

/// Why a session could not be started. The hardware has been torn down again.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum StartError {
    /// The adapter and the platform share no working mode
    NoCommonMode,
    /// The configured ladder is unusable
    InvalidLadder(LadderError),
    /// The cable was removed
    PluggedOut,
    /// The main IC of the selected mode is already enabled
    AlreadyStarted,
    /// Battery telemetry is unavailable
    Battery,
    /// The adapter rejected the initial setpoints
    Adapter,
    /// An IC could not be configured or enabled
    Ic,
}

/// Lifecycle of a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum SessionState {
    /// Charging
    Running,
    /// Charging finished normally
    Done,
    /// Charging was stopped by a fault or an external event
    Stopped,
}

/// What a tick asks of its scheduler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Tick {
    /// Run again after this many ms
    Continue(u32),
    /// The session completed
    Done,
    /// The session was stopped
    Stopped,
}

/// Per-IC readings.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct IcInfo {
    /// Bus current, mA
    pub ibus: Option<i32>,
    /// Bus voltage, mV
    pub vbus: Option<i32>,
    /// Die temperature, °C
    pub temp: Option<i32>,
}

/// Snapshot of a running session, refreshed by every control tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct ChargeInfo {
    /// Stage index
    pub stage: usize,
    /// IC topology
    pub topology: Option<IcTopology>,
    /// Readings of the enabled ICs, indexed main then aux
    pub ics: [Option<IcInfo>; 2],
    /// Adapter output voltage, mV
    pub vadapt: Option<i32>,
    /// Adapter output current, mA
    pub iadapt: i32,
    /// Adapter temperature
    pub tadapt: i32,
    /// Battery voltage, mV
    pub vbat: i32,
    /// Battery current, mA
    pub ibat: i32,
    /// Requested adapter voltage, mV
    pub vset: i32,
    /// Requested adapter current, mA
    pub iset: i32,
    /// Active thresholds
    pub params: ChargeParams,
}

/// Collaborators a session borrows for its lifetime.
pub struct SessionParts<'a, I, A, B, S> {
    /// IC registry
    pub ics: &'a mut IcManager<I>,
    /// Negotiated adapter
    pub adapter: &'a mut A,
    /// Battery gauge
    pub battery: &'a mut B,
    /// Diagnostic upload
    pub sink: &'a mut S,
    /// Diagnostic buffer
    pub log: &'a mut FaultLog,
    /// External events
    pub events: &'a ChargerEvents,
}

/// One charging attempt.
pub struct ChargeSession<'a, I, A, B, S> {
    ics: &'a mut IcManager<I>,
    adapter: &'a mut A,
    battery: &'a mut B,
    sink: &'a mut S,
    log: &'a mut FaultLog,
    events: &'a ChargerEvents,
    config: SessionConfig,
    mode: WorkingMode,
    protocol: Protocol,
    state: SessionState,
    ladder: StageLadder,
    path: PathSwitch,
    regulator: Regulator,
    params: ChargeParams,
    telemetry: Telemetry,
    flags: FaultFlags,
    info: ChargeInfo,
    elapsed_ms: u32,
    ibat_abnormal_cnt: u8,
    watchdog_active: bool,
    torn_down: bool,
}

impl<'a, I, A, B, S> ChargeSession<'a, I, A, B, S>
where
    I: IcOps,
    A: AdapterOps,
    B: BatteryOps,
    S: DiagnosticSink,
{
    /// Select a working mode for `negotiation`, program the adapter, arm the IC watchdogs
    /// and open the main path.
    pub async fn start(
        parts: SessionParts<'a, I, A, B, S>,
        negotiation: &AdapterNegotiationResult,
        config: SessionConfig,
    ) -> Result<Self, StartError> {
        let SessionParts {
            ics,
            adapter,
            battery,
            sink,
            log,
            events,
        } = parts;

        let mut local = AdapterSupportMode::new();
        for mode in WorkingMode::ALL {
            let main = IcHandle::new(mode, IcSlot::Main);
            if config.local_modes.supports(mode) && ics.is_registered(main) {
                local.insert(mode);
            }
        }
        let mode = select_working_mode(negotiation.support_mode, local)
            .ok_or(StartError::NoCommonMode)?;

        if events.plugged_out() {
            return Err(StartError::PluggedOut);
        }
        if ics.is_enabled(IcHandle::new(mode, IcSlot::Main)) {
            return Err(StartError::AlreadyStarted);
        }

        let mut ladder = StageLadder::new(&config.ladder)
            .and_then(|l| l.with_jump_stages(&config.jump_stages))
            .map_err(StartError::InvalidLadder)?;
        if let Some(limit) = config.first_cc_limit_ms {
            ladder = ladder.with_first_cc_limit(limit);
        }

        let vbat = battery.get_vbat().await.map_err(|_| StartError::Battery)?;
        // multi path failures only count against the session that saw them
        ics.clear_faults(mode);
        let path = PathSwitch::new(mode, ics.supports_multi(mode), config.path_switch);
        let regulator = Regulator::new(config.regulation, vbat, mode.volt_ratio());

        let mut session = ChargeSession {
            ics,
            adapter,
            battery,
            sink,
            log,
            events,
            mode,
            protocol: negotiation.selected_protocol,
            state: SessionState::Running,
            ladder,
            path,
            regulator,
            params: ChargeParams::default(),
            telemetry: Telemetry {
                vbat,
                ..Default::default()
            },
            flags: FaultFlags::new(),
            info: ChargeInfo::default(),
            elapsed_ms: 0,
            ibat_abnormal_cnt: 0,
            watchdog_active: false,
            torn_down: false,
            config,
        };

        if let Err(e) = session.open().await {
            error!("direct charge start failed: {}", e);
            session.record(ChargingFault::InitDirectCharge, format_args!("{:?}", e));
            session.stop().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn open(&mut self) -> Result<(), StartError> {
        info!("start {} charging over {}", self.mode, self.protocol);

        let (vset, iset) = (self.regulator.vset(), self.regulator.iset());
        if self.adapter.set_output_voltage(vset).await.is_err() {
            self.record(AdapterFault::SetVolt, format_args!("vset={}", vset));
            return Err(StartError::Adapter);
        }
        if self.adapter.set_output_current(iset).await.is_err() {
            self.record(AdapterFault::SetCurr, format_args!("iset={}", iset));
            return Err(StartError::Adapter);
        }

        let timeout = self.config.watchdog_timeout_ms;
        for slot in SLOTS {
            let handle = self.handle(slot);
            if !self.ics.is_registered(handle) {
                continue;
            }
            if self.ics.config_watchdog(handle, timeout).await.or_unsupported(()).is_err() {
                self.record(IcFault::Watchdog, format_args!("{:?}", slot));
                return Err(StartError::Ic);
            }
        }
        self.watchdog_active = true;

        if self.ics.enable(self.handle(IcSlot::Main), true).await.is_err() {
            self.record(ChargingFault::OpenPath, format_args!("main"));
            return Err(StartError::Ic);
        }

        self.refresh_thresholds().await;
        Ok(())
    }

    /// Working mode of this session
    pub fn mode(&self) -> WorkingMode {
        self.mode
    }

    /// Protocol used to talk to the adapter
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Lifecycle state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Stage index
    pub fn stage(&self) -> usize {
        self.ladder.stage()
    }

    /// IC topology, `None` while switching
    pub fn topology(&self) -> Option<IcTopology> {
        self.path.topology()
    }

    /// Raised stop conditions
    pub fn fault_flags(&self) -> FaultFlags {
        self.flags
    }

    /// Failed path transitions so far
    pub fn multi_ic_error_count(&self) -> u8 {
        self.path.error_count()
    }

    /// Thresholds in effect
    pub fn params(&self) -> &ChargeParams {
        &self.params
    }

    /// Latest snapshot
    pub fn info(&self) -> &ChargeInfo {
        &self.info
    }

    /// Disable direct charge from outside. Takes effect at the next tick.
    pub fn force_disable(&mut self) {
        self.flags.set_force_disable(true);
    }

    /// Is the watchdog tick still active?
    pub fn watchdog_active(&self) -> bool {
        self.watchdog_active
    }

    fn handle(&self, slot: IcSlot) -> IcHandle {
        IcHandle::new(self.mode, slot)
    }

    // A read that exhausted its retries stops the session.
    fn read_failed(&mut self, fault: impl Into<Fault>, context: &str) {
        error!("telemetry read failed in {}, stop direct charge", context);
        self.record(fault, format_args!("{}", context));
        self.flags.set_stop_on_error(true);
    }

    fn record(&mut self, fault: impl Into<Fault>, detail: Arguments<'_>) {
        let fault = fault.into();
        let text = detail_text(detail);
        if self.log.record(FaultRecord { fault, detail: &text }).is_err() {
            warn!("fault {} not recorded", fault);
        }
    }

    fn stop_requested(&self) -> bool {
        if self.flags.any() {
            info!("stop flags {}", self.flags);
            return true;
        }
        if self.events.priority_inversion() {
            info!("priority inversion, leaving direct charge");
            return true;
        }
        if self.events.plugged_out() {
            info!("charger removed");
            return true;
        }
        false
    }

    fn finished(&self) -> Option<Tick> {
        match self.state {
            SessionState::Running => None,
            SessionState::Done => Some(Tick::Done),
            SessionState::Stopped => Some(Tick::Stopped),
        }
    }

    /// One control period: path switching, regulation, info refresh and the termination
    /// checks.
    pub async fn control_tick<D: DelayNs>(&mut self, delay: &mut D) -> Tick {
        if let Some(tick) = self.finished() {
            return tick;
        }
        if self.stop_requested() {
            return self.stop().await;
        }

        let outcome = self
            .path
            .poll(self.ics, self.events.force_single_path(), delay)
            .await;
        self.handle_switch(outcome);

        self.regulate().await;
        self.update_info().await;

        if self.stop_requested() {
            return self.stop().await;
        }

        self.elapsed_ms = self.elapsed_ms.saturating_add(self.config.control_interval_ms);
        let timed_out = self
            .config
            .charge_time_limit_ms
            .map_or(false, |limit| self.elapsed_ms >= limit);
        if self.ladder.is_terminal() || timed_out {
            info!(
                "charge done, stage={} elapsed={}",
                self.ladder.stage(),
                self.elapsed_ms
            );
            self.state = SessionState::Done;
            self.teardown().await;
            return Tick::Done;
        }

        Tick::Continue(self.config.control_interval_ms)
    }

    fn handle_switch(&mut self, outcome: SwitchOutcome) {
        match outcome {
            SwitchOutcome::Hold
            | SwitchOutcome::ToMulti
            | SwitchOutcome::ToSingle
            | SwitchOutcome::Blocked => {}
            SwitchOutcome::MultiFailed(MultiFailure::Enable) => {
                self.record(IcFault::Enable, format_args!("aux"));
            }
            SwitchOutcome::MultiFailed(MultiFailure::NoCurrent { main_ma, aux_ma }) => {
                self.record(
                    IcFault::MultiIcCurrent,
                    format_args!("main={} aux={}", main_ma, aux_ma),
                );
            }
            SwitchOutcome::MultiFailed(failure) => {
                self.record(IcFault::MultiIcCurrent, format_args!("{:?}", failure));
            }
            SwitchOutcome::DisableFailed => {
                self.record(IcFault::Enable, format_args!("aux disable"));
                self.flags.set_stop_on_error(true);
            }
            SwitchOutcome::ReadFailed => {
                let state = self.path.state();
                self.record(IcFault::GetIbus, format_args!("{:?}", state));
            }
        }
    }

    async fn read_tls(&mut self) -> Option<i32> {
        let mut hottest = None;
        for slot in SLOTS {
            let handle = self.handle(slot);
            if !self.ics.is_enabled(handle) {
                continue;
            }
            match self.ics.get_temp(handle).await {
                Ok(t) => hottest = Some(hottest.map_or(t, |h: i32| h.max(t))),
                Err(IcError::Unsupported) => {}
                Err(_) => self.record(IcFault::GetTemp, format_args!("{:?}", slot)),
            }
        }
        hottest
    }

    async fn regulate(&mut self) {
        let Ok(vbat) = retry_read!(self.battery.get_vbat()) else {
            return self.read_failed(BatteryFault::GetVbat, "regulation");
        };
        let Ok(ibat) = retry_read!(self.battery.get_ibat()) else {
            return self.read_failed(BatteryFault::GetIbat, "regulation");
        };
        let Ok(iadapt) = retry_read!(self.adapter.get_output_current()) else {
            return self.read_failed(AdapterFault::GetIapt, "regulation");
        };
        let Ok(tadapt) = retry_read!(self.adapter.get_temp()) else {
            return self.read_failed(AdapterFault::GetTemp, "regulation");
        };
        let tls = self.read_tls().await;
        self.telemetry = Telemetry {
            vbat,
            ibat,
            iadapt,
            tls,
            tadapt,
        };

        match self.regulator.check_temperature(&self.telemetry) {
            Ok(()) => {}
            Err(OverTemp::Ic { tls, max }) => {
                error!("tls={} > {}, stop direct charge", tls, max);
                self.record(IcFault::TlsAbnormal, format_args!("tls={} > {}", tls, max));
                self.flags.set_stop_on_error(true);
                return;
            }
            Err(OverTemp::Adapter { tadapt, max }) => {
                error!("tadapt={} > {}, stop direct charge", tadapt, max);
                let text = detail_text(format_args!("tadp={} > {}", tadapt, max));
                self.record(AdapterFault::TadpAbnormal, format_args!("{}", text));
                if self.events.note_adapter_otp() >= ADP_OTP_CNT {
                    let code = AdapterFault::TadpAbnormal as u8;
                    if self.sink.report(FaultDomain::Adapter, code, &text).is_err() {
                        warn!("adapter otp report failed");
                    }
                }
                self.flags.set_stop_on_error(true);
                return;
            }
        }

        let adjustment = self.regulator.step(
            self.ladder.is_cv(),
            &self.params,
            &self.telemetry,
            self.mode.volt_ratio(),
        );
        match adjustment {
            Adjustment::Hold => {}
            Adjustment::Voltage(mv) => {
                if self.adapter.set_output_voltage(mv).await.is_err() {
                    self.record(AdapterFault::SetVolt, format_args!("vset={}", mv));
                    self.flags.set_stop_on_error(true);
                }
            }
            Adjustment::Current(ma) => {
                if self.adapter.set_output_current(ma).await.is_err() {
                    self.record(AdapterFault::SetCurr, format_args!("iset={}", ma));
                    self.flags.set_stop_on_error(true);
                }
            }
        }
    }

    async fn update_info(&mut self) {
        let mut ics = [None; 2];
        for slot in SLOTS {
            let handle = self.handle(slot);
            if !self.ics.is_enabled(handle) {
                continue;
            }
            ics[slot.index()] = Some(IcInfo {
                ibus: self.ics.get_ibus(handle).await.ok(),
                vbus: self.ics.get_vbus(handle).await.ok(),
                temp: self.ics.get_temp(handle).await.ok(),
            });
        }

        self.info = ChargeInfo {
            stage: self.ladder.stage(),
            topology: self.path.topology(),
            ics,
            vadapt: self.adapter.get_output_voltage().await.ok(),
            iadapt: self.telemetry.iadapt,
            tadapt: self.telemetry.tadapt,
            vbat: self.telemetry.vbat,
            ibat: self.telemetry.ibat,
            vset: self.regulator.vset(),
            iset: self.regulator.iset(),
            params: self.params,
        };
    }

    /// One threshold period: abnormal current check, SOH derating, stage selection and
    /// threshold derivation.
    pub async fn threshold_tick(&mut self) -> Tick {
        if let Some(tick) = self.finished() {
            return tick;
        }
        if self.stop_requested() {
            return self.stop().await;
        }

        match retry_read!(self.adapter.get_output_current()) {
            Ok(iadapt) if iadapt < self.config.ibat_abnormal_th_ma => {
                self.ibat_abnormal_cnt = self.ibat_abnormal_cnt.saturating_add(1);
            }
            Ok(_) => self.ibat_abnormal_cnt = 0,
            Err(_) => self.read_failed(AdapterFault::GetIapt, "threshold"),
        }
        if self.stop_requested() {
            return self.stop().await;
        }
        if self.ibat_abnormal_cnt > IBAT_ABNORMAL_MAX_CNT {
            error!("ibat abnormal, stop direct charge");
            let floor = self.config.ibat_abnormal_th_ma;
            self.record(
                BatteryFault::IbatAbnormal,
                format_args!("iadp below {} mA", floor),
            );
            self.flags.set_stop_on_error(true);
        } else {
            self.refresh_thresholds().await;
        }

        if self.stop_requested() {
            return self.stop().await;
        }
        Tick::Continue(self.config.threshold_interval_ms)
    }

    async fn refresh_thresholds(&mut self) {
        let Ok(vbat) = retry_read!(self.battery.get_vbat()) else {
            return self.read_failed(BatteryFault::GetVbat, "threshold");
        };
        let Ok(ibat) = retry_read!(self.battery.get_ibat()) else {
            return self.read_failed(BatteryFault::GetIbat, "threshold");
        };
        let Ok(tbat) = retry_read!(self.battery.get_temp()) else {
            return self.read_failed(ChargingFault::BatteryTemp, "read failed");
        };
        let iset_max = self.config.regulation.iset_max_ma;
        let adapter_max_ma = match self.adapter.get_max_current().await {
            Ok(ma) => ma.min(iset_max),
            Err(_) => {
                self.record(AdapterFault::GetIapt, format_args!("max current"));
                iset_max
            }
        };

        self.ladder.apply_soh(self.battery.soh_limits());
        let compensate_mv = compensation_mv(ibat, self.config.compensate_r_mohm);
        self.ladder.select(vbat, ibat, compensate_mv, self.elapsed_ms);

        let inputs = ParamInputs {
            ibat,
            tbat,
            compensate_r_mohm: self.config.compensate_r_mohm,
            adapter_max_ma,
            volt_ratio: self.mode.volt_ratio(),
            multi_path: self.path.state() == PathState::Multi,
            single_ic_limit_ma: self.config.single_ic_limit_ma,
        };
        self.params = self.ladder.params(&inputs, &self.config.temp_bands);
        if !self.params.temp_allowed {
            self.record(ChargingFault::BatteryTemp, format_args!("tbat={}", tbat));
            self.flags.set_stop_on_scp_info(true);
        }
    }

    /// Kick the watchdog of every enabled IC until teardown releases it.
    pub async fn watchdog_tick(&mut self) -> Tick {
        if !self.watchdog_active {
            return self.finished().unwrap_or(Tick::Stopped);
        }
        for slot in SLOTS {
            let handle = self.handle(slot);
            if !self.ics.is_enabled(handle) {
                continue;
            }
            if self.ics.kick_watchdog(handle).await.or_unsupported(()).is_err() {
                warn!("kick watchdog {} failed", handle);
            }
        }
        Tick::Continue(self.config.watchdog_kick_ms)
    }

    async fn stop(&mut self) -> Tick {
        if self.state == SessionState::Running {
            self.state = SessionState::Stopped;
        }
        self.teardown().await;
        self.finished().unwrap_or(Tick::Stopped)
    }

    /// Disable the ICs, release the watchdog and return the adapter to its default output.
    ///
    /// Runs once; later calls do nothing.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        if self.state == SessionState::Running {
            self.state = SessionState::Stopped;
        }
        info!("direct charge teardown, state {}", self.state);

        for slot in [IcSlot::Aux, IcSlot::Main] {
            let handle = self.handle(slot);
            if self.ics.is_enabled(handle) && self.ics.enable(handle, false).await.is_err() {
                self.record(IcFault::Enable, format_args!("disable {:?}", slot));
            }
        }

        let aux = self.handle(IcSlot::Aux);
        if self.ics.is_registered(aux)
            && self.ics.set_path_switch(aux, false).await.or_unsupported(()).is_err()
        {
            warn!("release aux path switch failed");
        }

        self.watchdog_active = false;
        for slot in SLOTS {
            let handle = self.handle(slot);
            if self.ics.is_registered(handle)
                && self.ics.config_watchdog(handle, 0).await.or_unsupported(()).is_err()
            {
                self.record(IcFault::Watchdog, format_args!("disarm {:?}", slot));
            }
        }

        if self.adapter.set_default().await.is_err() {
            self.record(ChargingFault::Teardown, format_args!("adapter default"));
        }

        for slot in SLOTS {
            let handle = self.handle(slot);
            if self.ics.is_initialized(handle) && self.ics.exit(handle).await.is_err() {
                self.record(ChargingFault::Teardown, format_args!("exit {:?}", slot));
            }
        }

        if self.adapter.reset_protocol_master(self.protocol).await.is_err() {
            warn!("reset protocol master failed");
        }

        if self.log.flush(self.sink).is_err() {
            warn!("fault report failed, kept for retry");
        }
    }
}

fn detail_text(args: Arguments<'_>) -> String<64> {
    let mut text = String::new();
    // a truncated detail is still worth keeping
    let _ = text.write_fmt(args);
    text
}

/// Run control ticks until the session completes or stops.
pub async fn run_control_loop<M, I, A, B, S, D>(
    session: &Mutex<M, ChargeSession<'_, I, A, B, S>>,
    mut delay: D,
) -> SessionState
where
    M: RawMutex,
    I: IcOps,
    A: AdapterOps,
    B: BatteryOps,
    S: DiagnosticSink,
    D: DelayNs,
{
    loop {
        let tick = session.lock().await.control_tick(&mut delay).await;
        match tick {
            Tick::Continue(ms) => delay.delay_ms(ms).await,
            Tick::Done => return SessionState::Done,
            Tick::Stopped => return SessionState::Stopped,
        }
    }
}

/// Run threshold ticks until the session completes or stops.
pub async fn run_threshold_loop<M, I, A, B, S, D>(
    session: &Mutex<M, ChargeSession<'_, I, A, B, S>>,
    mut delay: D,
) -> SessionState
where
    M: RawMutex,
    I: IcOps,
    A: AdapterOps,
    B: BatteryOps,
    S: DiagnosticSink,
    D: DelayNs,
{
    loop {
        let tick = session.lock().await.threshold_tick().await;
        match tick {
            Tick::Continue(ms) => delay.delay_ms(ms).await,
            Tick::Done => return SessionState::Done,
            Tick::Stopped => return SessionState::Stopped,
        }
    }
}

/// Kick IC watchdogs until teardown releases them.
pub async fn run_watchdog_loop<M, I, A, B, S, D>(
    session: &Mutex<M, ChargeSession<'_, I, A, B, S>>,
    mut delay: D,
) -> SessionState
where
    M: RawMutex,
    I: IcOps,
    A: AdapterOps,
    B: BatteryOps,
    S: DiagnosticSink,
    D: DelayNs,
{
    loop {
        let tick = session.lock().await.watchdog_tick().await;
        match tick {
            Tick::Continue(ms) => delay.delay_ms(ms).await,
            Tick::Done | Tick::Stopped => return session.lock().await.state(),
        }
    }
}
