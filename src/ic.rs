//! Charge pump operation contract and the per-(mode, slot) registry.

use crate::types::{IcHandle, IcSlot, IcStatus, WorkingMode};

/// Hardware I/O failures are retried this many times before being surfaced.
pub const IC_IO_RETRY_TIMES: usize = 3;
/// An IC with this many noted errors is kept out of multi path.
pub const IC_ERROR_CNT_MAX: u8 = 4;

/// Result of an IC operation
pub type IcResult<T, E> = Result<T, IcError<E>>;

/// Failure of an IC operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum IcError<E> {
    /// The IC does not implement this operation. Callers substitute a default.
    Unsupported,
    /// No IC is registered for the requested handle
    NotRegistered,
    /// The underlying bus or device reported an error
    Bus(E),
}

/// Helpers for the tri-state IC result.
pub trait IcResultExt<T, E> {
    /// Replace `Unsupported` with `default`, keep every other outcome.
    fn or_unsupported(self, default: T) -> IcResult<T, E>;
}

impl<T, E> IcResultExt<T, E> for IcResult<T, E> {
    fn or_unsupported(self, default: T) -> IcResult<T, E> {
        match self {
            Err(IcError::Unsupported) => Ok(default),
            other => other,
        }
    }
}

/// Operations every charge pump or load switch driver provides.
///
/// Currents are in mA, voltages in mV, temperatures in °C and frequencies in kHz.
#[allow(async_fn_in_trait)]
pub trait IcOps {
    /// Driver specific bus error
    type Error;

    /// Bring the IC into a known configured state.
    async fn init(&mut self) -> IcResult<(), Self::Error>;

    /// Release the IC at session teardown.
    async fn exit(&mut self) -> IcResult<(), Self::Error>;

    /// Open (`true`) or close (`false`) the charge path through this IC.
    async fn enable(&mut self, enable: bool) -> IcResult<(), Self::Error>;

    /// Input (bus) current
    async fn get_ibus(&mut self) -> IcResult<i32, Self::Error>;

    /// Input (bus) voltage
    async fn get_vbus(&mut self) -> IcResult<i32, Self::Error>;

    /// Battery current through this IC
    async fn get_ibat(&mut self) -> IcResult<i32, Self::Error> {
        Err(IcError::Unsupported)
    }

    /// Die temperature
    async fn get_temp(&mut self) -> IcResult<i32, Self::Error> {
        Err(IcError::Unsupported)
    }

    /// Reset the IC's watchdog timer.
    async fn kick_watchdog(&mut self) -> IcResult<(), Self::Error>;

    /// Arm the watchdog with the given timeout, or disarm it with `0`.
    async fn config_watchdog(&mut self, _timeout_ms: u32) -> IcResult<(), Self::Error> {
        Err(IcError::Unsupported)
    }

    /// Switching frequency
    async fn get_freq(&mut self) -> IcResult<u32, Self::Error> {
        Err(IcError::Unsupported)
    }

    /// Set the switching frequency.
    async fn set_freq(&mut self, _freq_khz: u32) -> IcResult<(), Self::Error> {
        Err(IcError::Unsupported)
    }

    /// Latched protection flags
    async fn get_status(&mut self) -> IcResult<IcStatus, Self::Error> {
        Err(IcError::Unsupported)
    }

    /// Close or open the wired channel switch in front of this IC.
    async fn set_path_switch(&mut self, _closed: bool) -> IcResult<(), Self::Error> {
        Err(IcError::Unsupported)
    }

    /// Human readable part name
    fn name(&self) -> &'static str {
        "unknown"
    }
}

// Retries an IC read on bus errors, up to `IC_IO_RETRY_TIMES` attempts in total.
macro_rules! retry_io {
    ($op:expr) => {{
        let mut attempt = 0;
        loop {
            match $op.await {
                Err(IcError::Bus(e)) => {
                    attempt += 1;
                    if attempt >= IC_IO_RETRY_TIMES {
                        break Err(IcError::Bus(e));
                    }
                    trace!("ic read failed, retry {}", attempt);
                }
                other => break other,
            }
        }
    }};
}

/// A handle is already bound to an IC.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum RegisterError {
    /// The `(mode, slot)` key is occupied
    Occupied(IcHandle),
}

struct IcEntry<I> {
    ops: I,
    initialized: bool,
    enabled: bool,
    error_cnt: u8,
}

/// Registry of charge pumps keyed by `(working mode, slot)`.
///
/// Each key is bound at most once. Callers address ICs through [`IcHandle`]s and never see
/// the driver itself.
pub struct IcManager<I> {
    slots: [[Option<IcEntry<I>>; 2]; 3],
}

impl<I: IcOps> Default for IcManager<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: IcOps> IcManager<I> {
    /// Create an empty registry
    pub const fn new() -> Self {
        IcManager {
            slots: [[None, None], [None, None], [None, None]],
        }
    }

    /// Bind `ops` to `handle`. Fails if the handle is already bound.
    pub fn register(&mut self, handle: IcHandle, ops: I) -> Result<(), RegisterError> {
        let slot = &mut self.slots[handle.mode.index()][handle.slot.index()];
        if slot.is_some() {
            warn!("ic {} already registered", handle);
            return Err(RegisterError::Occupied(handle));
        }
        info!("register ic {} for {}", ops.name(), handle);
        *slot = Some(IcEntry {
            ops,
            initialized: false,
            enabled: false,
            error_cnt: 0,
        });
        Ok(())
    }

    /// Is an IC bound to `handle`?
    pub fn is_registered(&self, handle: IcHandle) -> bool {
        self.entry(handle).is_some()
    }

    /// Does `mode` have both a main and an aux IC?
    pub fn supports_multi(&self, mode: WorkingMode) -> bool {
        self.is_registered(IcHandle::new(mode, IcSlot::Main))
            && self.is_registered(IcHandle::new(mode, IcSlot::Aux))
    }

    /// Has the last `enable` call on `handle` left the IC enabled?
    pub fn is_enabled(&self, handle: IcHandle) -> bool {
        self.entry(handle).map_or(false, |e| e.enabled)
    }

    /// Has `init` succeeded on `handle` since the last `exit`?
    pub fn is_initialized(&self, handle: IcHandle) -> bool {
        self.entry(handle).map_or(false, |e| e.initialized)
    }

    /// Count one error against `handle`. Saturates at [`IC_ERROR_CNT_MAX`].
    pub fn note_error(&mut self, handle: IcHandle) {
        if let Some(entry) = self.entry_mut(handle) {
            if entry.error_cnt < IC_ERROR_CNT_MAX {
                entry.error_cnt += 1;
            }
            debug!("ic {} error count {}", handle, entry.error_cnt);
        }
    }

    /// Errors noted against `handle` since the last [`clear_faults`](Self::clear_faults)
    pub fn error_count(&self, handle: IcHandle) -> u8 {
        self.entry(handle).map_or(0, |e| e.error_cnt)
    }

    /// Clear the error counts of every IC in `mode`.
    pub fn clear_faults(&mut self, mode: WorkingMode) {
        for entry in self.slots[mode.index()].iter_mut().flatten() {
            entry.error_cnt = 0;
        }
    }

    /// Has `handle` reached the error ceiling?
    pub fn has_fault(&self, handle: IcHandle) -> bool {
        self.error_count(handle) >= IC_ERROR_CNT_MAX
    }

    /// Part name of the IC bound to `handle`
    pub fn name(&self, handle: IcHandle) -> Option<&'static str> {
        self.entry(handle).map(|e| e.ops.name())
    }

    /// Initialize the IC.
    pub async fn init(&mut self, handle: IcHandle) -> IcResult<(), I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        entry.ops.init().await?;
        entry.initialized = true;
        Ok(())
    }

    /// Enable or disable the IC.
    ///
    /// Enabling an uninitialized IC runs `init` first. Disabling never calls `exit`; the IC
    /// keeps its configuration so it can be re-enabled cheaply.
    pub async fn enable(&mut self, handle: IcHandle, enable: bool) -> IcResult<(), I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        if enable && !entry.initialized {
            entry.ops.init().await?;
            entry.initialized = true;
        }
        entry.ops.enable(enable).await?;
        entry.enabled = enable;
        debug!("ic {} enable={}", handle, enable);
        Ok(())
    }

    /// Release the IC. Only used at session teardown.
    pub async fn exit(&mut self, handle: IcHandle) -> IcResult<(), I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        entry.ops.exit().await?;
        entry.initialized = false;
        entry.enabled = false;
        Ok(())
    }

    /// Bus current, retried on bus errors
    pub async fn get_ibus(&mut self, handle: IcHandle) -> IcResult<i32, I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        retry_io!(entry.ops.get_ibus())
    }

    /// Bus voltage, retried on bus errors
    pub async fn get_vbus(&mut self, handle: IcHandle) -> IcResult<i32, I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        retry_io!(entry.ops.get_vbus())
    }

    /// Battery current, retried on bus errors
    pub async fn get_ibat(&mut self, handle: IcHandle) -> IcResult<i32, I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        retry_io!(entry.ops.get_ibat())
    }

    /// Die temperature, retried on bus errors
    pub async fn get_temp(&mut self, handle: IcHandle) -> IcResult<i32, I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        retry_io!(entry.ops.get_temp())
    }

    /// Latched protection status
    pub async fn get_status(&mut self, handle: IcHandle) -> IcResult<IcStatus, I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        entry.ops.get_status().await
    }

    /// Kick the watchdog of the IC.
    pub async fn kick_watchdog(&mut self, handle: IcHandle) -> IcResult<(), I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        entry.ops.kick_watchdog().await
    }

    /// Arm (`timeout_ms > 0`) or disarm the IC watchdog.
    pub async fn config_watchdog(
        &mut self,
        handle: IcHandle,
        timeout_ms: u32,
    ) -> IcResult<(), I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        entry.ops.config_watchdog(timeout_ms).await
    }

    /// Switching frequency
    pub async fn get_freq(&mut self, handle: IcHandle) -> IcResult<u32, I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        entry.ops.get_freq().await
    }

    /// Set the switching frequency.
    pub async fn set_freq(&mut self, handle: IcHandle, freq_khz: u32) -> IcResult<(), I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        entry.ops.set_freq(freq_khz).await
    }

    /// Close or open the wired channel switch in front of the IC.
    pub async fn set_path_switch(
        &mut self,
        handle: IcHandle,
        closed: bool,
    ) -> IcResult<(), I::Error> {
        let entry = self.entry_mut(handle).ok_or(IcError::NotRegistered)?;
        entry.ops.set_path_switch(closed).await
    }

    fn entry(&self, handle: IcHandle) -> Option<&IcEntry<I>> {
        self.slots[handle.mode.index()][handle.slot.index()].as_ref()
    }

    fn entry_mut(&mut self, handle: IcHandle) -> Option<&mut IcEntry<I>> {
        self.slots[handle.mode.index()][handle.slot.index()].as_mut()
    }
}
