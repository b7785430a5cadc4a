//! Single/multi IC path selection driven by bus current.

use embedded_hal_async::delay::DelayNs;

use crate::ic::{IcManager, IcOps, IcResultExt};
use crate::types::{IcHandle, IcSlot, IcStatus, IcTopology, WorkingMode};

/// Normalized current at which a second IC is wanted, mA
pub const DC_MULTI_IC_IBAT_TH: i32 = 4000;
/// Half width of the hysteresis band around the threshold, mA
pub const DC_CURRENT_OFFSET: i32 = 300;
/// Consecutive samples required on one side of the band
pub const MULTI_IC_CHECK_COUNT: u8 = 3;
/// Wait after enabling the aux IC before checking current sharing
pub const MULTI_IC_SETTLE_MS: u32 = 250;
/// Each IC must carry more than this once paralleled, mA
pub const MIN_CURRENT_FOR_MULTI_IC: i32 = 500;
/// Current sharing is checked this many times before giving up
pub const MULTI_IC_CONFIRM_RETRIES: u8 = 10;
/// Pause between current sharing checks
pub const MULTI_IC_CONFIRM_INTERVAL_MS: u32 = 30;
/// Failed transitions tolerated before multi path is locked out
pub const DC_MULTI_ERR_CNT_MAX: u8 = 4;

/// Path switch tunables.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct PathSwitchConfig {
    /// Normalized current threshold, mA
    pub threshold_ma: i32,
    /// Hysteresis margin on either side of the threshold, mA
    pub margin_ma: i32,
    /// Consecutive samples needed to switch
    pub debounce: u8,
    /// Settle delay after enabling the aux IC
    pub settle_ms: u32,
    /// Minimum per-IC current that proves a path is open, mA
    pub min_open_ma: i32,
    /// Current sharing checks before a multi path attempt fails
    pub confirm_retries: u8,
    /// Delay between current sharing checks
    pub confirm_interval_ms: u32,
    /// Multi path is locked out once the error count exceeds this
    pub error_ceiling: u8,
    /// The 4:1 path is built from two cascaded 2:1 stages, so the IC sees half the ratio
    pub two_stage_sc4: bool,
}

impl Default for PathSwitchConfig {
    fn default() -> Self {
        PathSwitchConfig {
            threshold_ma: DC_MULTI_IC_IBAT_TH,
            margin_ma: DC_CURRENT_OFFSET,
            debounce: MULTI_IC_CHECK_COUNT,
            settle_ms: MULTI_IC_SETTLE_MS,
            min_open_ma: MIN_CURRENT_FOR_MULTI_IC,
            confirm_retries: MULTI_IC_CONFIRM_RETRIES,
            confirm_interval_ms: MULTI_IC_CONFIRM_INTERVAL_MS,
            error_ceiling: DC_MULTI_ERR_CNT_MAX,
            two_stage_sc4: false,
        }
    }
}

/// Controller state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum PathState {
    /// One IC carries all current
    Single(IcSlot),
    /// Both ICs carry current
    Multi,
    /// A transition is in progress
    Switching,
}

/// Why a single to multi transition was abandoned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum MultiFailure {
    /// The wired channel in front of the aux IC could not be closed
    PathSwitch,
    /// The aux IC could not be enabled
    Enable,
    /// One of the ICs did not pick up current
    NoCurrent {
        /// Last main IC reading, mA
        main_ma: i32,
        /// Last aux IC reading, mA
        aux_ma: i32,
    },
}

/// Result of one path switch poll.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum SwitchOutcome {
    /// No transition
    Hold,
    /// Now running both ICs
    ToMulti,
    /// Now running the main IC only
    ToSingle,
    /// Multi path is wanted but the aux IC reached its error ceiling or latched a
    /// protection. Nothing was touched.
    Blocked,
    /// A multi path attempt failed and was rolled back
    MultiFailed(MultiFailure),
    /// The aux IC could not be disabled. The topology is unchanged, or inconsistent if
    /// a rollback was in progress.
    DisableFailed,
    /// Bus current could not be read. Debounce restarts.
    ReadFailed,
}

/// Keeps the IC topology matched to the bus current.
#[derive(Debug)]
pub struct PathSwitch {
    mode: WorkingMode,
    multi_capable: bool,
    config: PathSwitchConfig,
    state: PathState,
    up_count: u8,
    down_count: u8,
    error_count: u8,
}

impl PathSwitch {
    /// Create a controller for `mode`, starting on the main IC.
    ///
    /// With `multi_capable == false` the controller never leaves single path.
    pub fn new(mode: WorkingMode, multi_capable: bool, config: PathSwitchConfig) -> Self {
        PathSwitch {
            mode,
            multi_capable,
            config,
            state: PathState::Single(IcSlot::Main),
            up_count: 0,
            down_count: 0,
            error_count: 0,
        }
    }

    /// Current controller state
    pub fn state(&self) -> PathState {
        self.state
    }

    /// Stable topology, `None` while switching
    pub fn topology(&self) -> Option<IcTopology> {
        match self.state {
            PathState::Single(slot) => Some(IcTopology::Single(slot)),
            PathState::Multi => Some(IcTopology::Multi),
            PathState::Switching => None,
        }
    }

    /// Failed transitions so far
    pub fn error_count(&self) -> u8 {
        self.error_count
    }

    /// Has the error ceiling locked out multi path?
    pub fn multi_locked_out(&self) -> bool {
        self.error_count > self.config.error_ceiling
    }

    /// Bus current scaled to the battery side.
    pub fn normalize(&self, ibus_ma: i32) -> i32 {
        let ratio = match self.mode {
            WorkingMode::Sc4 if self.config.two_stage_sc4 => self.mode.volt_ratio() / 2,
            mode => mode.volt_ratio(),
        };
        ibus_ma.saturating_mul(ratio)
    }

    fn handle(&self, slot: IcSlot) -> IcHandle {
        IcHandle::new(self.mode, slot)
    }

    /// Does the IC enable state match the recorded topology?
    pub fn is_consistent<I: IcOps>(&self, ics: &IcManager<I>) -> bool {
        let main = ics.is_enabled(self.handle(IcSlot::Main));
        let aux = ics.is_enabled(self.handle(IcSlot::Aux));
        match self.state {
            PathState::Multi => main && aux,
            PathState::Single(IcSlot::Main) => main && !aux,
            PathState::Single(IcSlot::Aux) => aux && !main,
            PathState::Switching => true,
        }
    }

    fn reset_debounce(&mut self) {
        self.up_count = 0;
        self.down_count = 0;
    }

    fn record_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
        if self.multi_locked_out() {
            warn!("multi ic errors {}, single path only", self.error_count);
        }
    }

    /// Sample the bus current once and switch topology if the debounce completes.
    ///
    /// `force_single` moves a multi path session to single path immediately and keeps it
    /// there for as long as it is raised.
    pub async fn poll<I: IcOps, D: DelayNs>(
        &mut self,
        ics: &mut IcManager<I>,
        force_single: bool,
        delay: &mut D,
    ) -> SwitchOutcome {
        if force_single && self.state == PathState::Multi {
            info!("forced to single path");
            self.reset_debounce();
            return self.to_single(ics).await;
        }
        if !self.multi_capable {
            return SwitchOutcome::Hold;
        }

        let ibus = match self.state {
            PathState::Single(slot) => ics.get_ibus(self.handle(slot)).await,
            PathState::Multi => {
                match (
                    ics.get_ibus(self.handle(IcSlot::Main)).await,
                    ics.get_ibus(self.handle(IcSlot::Aux)).await,
                ) {
                    (Ok(main), Ok(aux)) => Ok(main + aux),
                    (Err(e), _) | (_, Err(e)) => Err(e),
                }
            }
            PathState::Switching => return SwitchOutcome::Hold,
        };
        let Ok(ibus) = ibus else {
            warn!("path switch ibus read failed");
            self.reset_debounce();
            return SwitchOutcome::ReadFailed;
        };

        let current = self.normalize(ibus);
        if current >= self.config.threshold_ma + self.config.margin_ma {
            self.up_count = self.up_count.saturating_add(1);
        } else {
            self.up_count = 0;
        }
        if current <= self.config.threshold_ma - self.config.margin_ma {
            self.down_count = self.down_count.saturating_add(1);
        } else {
            self.down_count = 0;
        }
        trace!(
            "path {} current={} up={} down={}",
            self.state,
            current,
            self.up_count,
            self.down_count
        );

        match self.state {
            PathState::Single(_) if self.up_count >= self.config.debounce => {
                self.reset_debounce();
                if force_single || self.multi_locked_out() {
                    return SwitchOutcome::Hold;
                }
                self.to_multi(ics, delay).await
            }
            PathState::Multi if self.down_count >= self.config.debounce => {
                self.reset_debounce();
                self.to_single(ics).await
            }
            _ => SwitchOutcome::Hold,
        }
    }

    async fn aux_blocked<I: IcOps>(&self, ics: &mut IcManager<I>) -> bool {
        let aux = self.handle(IcSlot::Aux);
        if ics.has_fault(aux) {
            warn!("aux ic error count {}, multi path blocked", ics.error_count(aux));
            return true;
        }
        match ics.get_status(aux).await.or_unsupported(IcStatus::new()) {
            Ok(status) if status.has_fault() => {
                warn!("aux ic status {}", status);
                true
            }
            Ok(_) => false,
            Err(_) => {
                warn!("aux ic status unreadable");
                true
            }
        }
    }

    async fn to_multi<I: IcOps, D: DelayNs>(
        &mut self,
        ics: &mut IcManager<I>,
        delay: &mut D,
    ) -> SwitchOutcome {
        let main = self.handle(IcSlot::Main);
        let aux = self.handle(IcSlot::Aux);
        if self.aux_blocked(ics).await {
            return SwitchOutcome::Blocked;
        }
        self.state = PathState::Switching;
        info!("switching to multi path");

        // released by the last switch back to single path
        if ics.set_path_switch(aux, true).await.or_unsupported(()).is_err() {
            return self.abandon_multi(ics, MultiFailure::PathSwitch).await;
        }
        if ics.enable(aux, true).await.is_err() {
            return self.abandon_multi(ics, MultiFailure::Enable).await;
        }
        delay.delay_ms(self.config.settle_ms).await;

        let mut readings = (0, 0);
        for _ in 0..self.config.confirm_retries.max(1) {
            if let (Ok(main_ma), Ok(aux_ma)) =
                (ics.get_ibus(main).await, ics.get_ibus(aux).await)
            {
                readings = (main_ma, aux_ma);
                if main_ma > self.config.min_open_ma && aux_ma > self.config.min_open_ma {
                    self.state = PathState::Multi;
                    info!("multi path open, main={} aux={}", main_ma, aux_ma);
                    debug_assert!(self.is_consistent(ics));
                    return SwitchOutcome::ToMulti;
                }
            }
            delay.delay_ms(self.config.confirm_interval_ms).await;
        }

        // the aux IC is on but carries nothing
        ics.note_error(aux);
        let failure = MultiFailure::NoCurrent {
            main_ma: readings.0,
            aux_ma: readings.1,
        };
        self.abandon_multi(ics, failure).await
    }

    async fn abandon_multi<I: IcOps>(
        &mut self,
        ics: &mut IcManager<I>,
        failure: MultiFailure,
    ) -> SwitchOutcome {
        let aux = self.handle(IcSlot::Aux);
        error!("multi path failed: {}", failure);
        self.record_error();
        self.state = PathState::Single(IcSlot::Main);

        if ics.is_enabled(aux) && ics.enable(aux, false).await.is_err() {
            error!("aux ic stuck enabled after failed multi path");
            return SwitchOutcome::DisableFailed;
        }
        if ics.set_path_switch(aux, false).await.or_unsupported(()).is_err() {
            warn!("release aux path switch failed");
        }
        debug_assert!(self.is_consistent(ics));
        SwitchOutcome::MultiFailed(failure)
    }

    async fn to_single<I: IcOps>(&mut self, ics: &mut IcManager<I>) -> SwitchOutcome {
        let aux = self.handle(IcSlot::Aux);
        self.state = PathState::Switching;
        info!("switching to single path");

        if ics.enable(aux, false).await.is_err() {
            error!("disable aux ic failed, staying on multi path");
            self.record_error();
            self.state = PathState::Multi;
            return SwitchOutcome::DisableFailed;
        }
        if ics.set_path_switch(aux, false).await.or_unsupported(()).is_err() {
            warn!("release aux path switch failed");
        }

        self.state = PathState::Single(IcSlot::Main);
        debug_assert!(self.is_consistent(ics));
        SwitchOutcome::ToSingle
    }
}
