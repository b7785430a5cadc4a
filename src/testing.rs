//! Mock collaborators shared by the unit tests.

use core::cell::Cell;

use embedded_hal_async::delay::DelayNs;

use crate::adapter::{AdapterOps, Ping, PingError};
use crate::battery::{BatteryOps, SohLimits};
use crate::fault::{DiagnosticSink, FaultDomain};
use crate::ic::{IcError, IcOps, IcResult};
use crate::types::{IcStatus, Protocol};

/// Completes immediately.
pub struct NoDelay;

impl DelayNs for NoDelay {
    async fn delay_ns(&mut self, _ns: u32) {}
}

/// Yields once so that joined loops interleave.
pub struct YieldDelay;

impl DelayNs for YieldDelay {
    async fn delay_ns(&mut self, _ns: u32) {
        embassy_futures::yield_now().await;
    }
}

/// Observable and scriptable state of one mock IC.
#[derive(Default)]
pub struct IcPins {
    /// Bus current reported while enabled
    pub ibus: Cell<i32>,
    pub vbus: Cell<i32>,
    pub temp: Cell<i32>,
    pub status: Cell<IcStatus>,
    pub enabled: Cell<bool>,
    pub inits: Cell<u32>,
    pub exits: Cell<u32>,
    pub enables: Cell<u32>,
    pub disables: Cell<u32>,
    pub kicks: Cell<u32>,
    pub watchdog_ms: Cell<Option<u32>>,
    pub path_switch_opened: Cell<u32>,
    pub path_switch_closed: Cell<u32>,
    /// The wired channel is open, the IC sees no current
    pub channel_cut: Cell<bool>,
    pub fail_enable: Cell<bool>,
    pub fail_disable: Cell<bool>,
    pub fail_ibus: Cell<bool>,
}

impl IcPins {
    pub fn with_ibus(ibus: i32) -> Self {
        let pins = IcPins::default();
        pins.ibus.set(ibus);
        pins.vbus.set(8800);
        pins.temp.set(40);
        pins
    }
}

pub struct MockIc<'a>(pub &'a IcPins);

impl IcOps for MockIc<'_> {
    type Error = ();

    async fn init(&mut self) -> IcResult<(), ()> {
        self.0.inits.set(self.0.inits.get() + 1);
        Ok(())
    }

    async fn exit(&mut self) -> IcResult<(), ()> {
        self.0.exits.set(self.0.exits.get() + 1);
        Ok(())
    }

    async fn enable(&mut self, enable: bool) -> IcResult<(), ()> {
        let pins = self.0;
        if enable {
            if pins.fail_enable.get() {
                return Err(IcError::Bus(()));
            }
            pins.enables.set(pins.enables.get() + 1);
        } else {
            if pins.fail_disable.get() {
                return Err(IcError::Bus(()));
            }
            pins.disables.set(pins.disables.get() + 1);
        }
        pins.enabled.set(enable);
        Ok(())
    }

    async fn get_ibus(&mut self) -> IcResult<i32, ()> {
        if self.0.fail_ibus.get() {
            return Err(IcError::Bus(()));
        }
        Ok(if self.0.enabled.get() && !self.0.channel_cut.get() {
            self.0.ibus.get()
        } else {
            0
        })
    }

    async fn get_vbus(&mut self) -> IcResult<i32, ()> {
        Ok(self.0.vbus.get())
    }

    async fn get_temp(&mut self) -> IcResult<i32, ()> {
        Ok(self.0.temp.get())
    }

    async fn kick_watchdog(&mut self) -> IcResult<(), ()> {
        self.0.kicks.set(self.0.kicks.get() + 1);
        Ok(())
    }

    async fn config_watchdog(&mut self, timeout_ms: u32) -> IcResult<(), ()> {
        self.0.watchdog_ms.set(Some(timeout_ms));
        Ok(())
    }

    async fn get_status(&mut self) -> IcResult<IcStatus, ()> {
        Ok(self.0.status.get())
    }

    async fn set_path_switch(&mut self, closed: bool) -> IcResult<(), ()> {
        let pins = self.0;
        if closed {
            pins.path_switch_closed.set(pins.path_switch_closed.get() + 1);
        } else {
            pins.path_switch_opened.set(pins.path_switch_opened.get() + 1);
        }
        pins.channel_cut.set(!closed);
        Ok(())
    }
}

/// An adapter that answers SCP with the given modes and tracks its setpoints.
pub struct MockAdapter {
    pub ping: Ping,
    pub vset: i32,
    pub iset: i32,
    pub iout: i32,
    pub max_ma: i32,
    pub temp: i32,
    pub defaults: u32,
    pub master_resets: u32,
    pub fail_iout: bool,
}

impl MockAdapter {
    pub fn new(ping: Ping) -> Self {
        MockAdapter {
            ping,
            vset: 0,
            iset: 0,
            iout: 2000,
            max_ma: 5000,
            temp: 35,
            defaults: 0,
            master_resets: 0,
            fail_iout: false,
        }
    }
}

impl AdapterOps for MockAdapter {
    type Error = ();

    async fn ping(&mut self, protocol: Protocol) -> Result<Ping, PingError<()>> {
        Ok(match protocol {
            Protocol::Scp => self.ping,
            _ => Ping::Unsupported,
        })
    }
    async fn reset_adapter(&mut self, _: Protocol) -> Result<(), ()> {
        Ok(())
    }
    async fn reset_protocol_master(&mut self, _: Protocol) -> Result<(), ()> {
        self.master_resets += 1;
        Ok(())
    }
    async fn set_output_voltage(&mut self, mv: i32) -> Result<(), ()> {
        self.vset = mv;
        Ok(())
    }
    async fn set_output_current(&mut self, ma: i32) -> Result<(), ()> {
        self.iset = ma;
        Ok(())
    }
    async fn get_output_voltage(&mut self) -> Result<i32, ()> {
        Ok(self.vset)
    }
    async fn get_output_current(&mut self) -> Result<i32, ()> {
        if self.fail_iout {
            return Err(());
        }
        Ok(self.iout)
    }
    async fn get_max_current(&mut self) -> Result<i32, ()> {
        Ok(self.max_ma)
    }
    async fn get_temp(&mut self) -> Result<i32, ()> {
        Ok(self.temp)
    }
    async fn set_default(&mut self) -> Result<(), ()> {
        self.defaults += 1;
        Ok(())
    }
}

pub struct MockBattery {
    pub vbat: i32,
    pub ibat: i32,
    pub temp: i32,
    pub soh: SohLimits,
    pub vbat_reads: u32,
    /// `get_vbat` fails `vbat_failures` times in a row from this read on
    pub vbat_fail_at: Option<u32>,
    pub vbat_failures: u32,
}

impl Default for MockBattery {
    fn default() -> Self {
        MockBattery {
            vbat: 3800,
            ibat: 4000,
            temp: 25,
            soh: SohLimits::NONE,
            vbat_reads: 0,
            vbat_fail_at: None,
            vbat_failures: 0,
        }
    }
}

impl BatteryOps for MockBattery {
    type Error = ();

    async fn get_vbat(&mut self) -> Result<i32, ()> {
        let read = self.vbat_reads;
        self.vbat_reads += 1;
        if let Some(at) = self.vbat_fail_at {
            if read >= at && read - at < self.vbat_failures {
                return Err(());
            }
        }
        Ok(self.vbat)
    }
    async fn get_ibat(&mut self) -> Result<i32, ()> {
        Ok(self.ibat)
    }
    async fn get_temp(&mut self) -> Result<i32, ()> {
        Ok(self.temp)
    }
    fn soh_limits(&self) -> SohLimits {
        self.soh
    }
}

#[derive(Default)]
pub struct MockSink {
    pub reports: heapless::Vec<(FaultDomain, u8), 8>,
}

impl DiagnosticSink for MockSink {
    type Error = ();

    fn report(&mut self, domain: FaultDomain, code: u8, _text: &str) -> Result<(), ()> {
        self.reports.push((domain, code)).map_err(|_| ())
    }
}
