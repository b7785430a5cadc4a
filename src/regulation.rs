//! Closed loop adjustment of the adapter output against the charging thresholds.

use crate::stage::ChargeParams;

/// Adapter voltage step, mV
pub const DC_VSTEP: i32 = 10;
/// Dead band below the current ceiling, mA
pub const DC_DELTA_ERR: i32 = 200;
/// Battery side current added per regulation step, mA
pub const DC_CURRENT_STEP: i32 = 1000;
/// IC die temperature limit, °C
pub const DC_MAX_TLS: i32 = 85;
/// Adapter temperature limit, °C
pub const DC_MAX_TADAPT: i32 = 80;

/// Regulation tunables.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct RegulationConfig {
    /// Voltage step, mV
    pub vstep_mv: i32,
    /// Dead band below the current ceiling, mA
    pub delta_err_ma: i32,
    /// IC die temperature limit, °C
    pub max_tls: i32,
    /// Adapter temperature limit, °C
    pub max_tadapt: i32,
    /// Highest voltage that may be requested, mV
    pub vset_max_mv: i32,
    /// Highest current that may be requested, mA
    pub iset_max_ma: i32,
    /// Added to `vbat * ratio` for the initial voltage request, mV
    pub init_vset_offset_mv: i32,
    /// Initial current request, mA
    pub init_iset_ma: i32,
}

impl Default for RegulationConfig {
    fn default() -> Self {
        RegulationConfig {
            vstep_mv: DC_VSTEP,
            delta_err_ma: DC_DELTA_ERR,
            max_tls: DC_MAX_TLS,
            max_tadapt: DC_MAX_TADAPT,
            vset_max_mv: 20_000,
            iset_max_ma: 6_000,
            init_vset_offset_mv: 300,
            init_iset_ma: 1_000,
        }
    }
}

/// Readings a regulation step works from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Telemetry {
    /// Battery voltage, mV
    pub vbat: i32,
    /// Battery current, mA
    pub ibat: i32,
    /// Adapter output current, mA
    pub iadapt: i32,
    /// Hottest enabled IC, if any IC reports temperature
    pub tls: Option<i32>,
    /// Adapter temperature
    pub tadapt: i32,
}

/// A temperature limit was exceeded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum OverTemp {
    /// IC die
    Ic {
        /// Reading
        tls: i32,
        /// Limit
        max: i32,
    },
    /// Adapter
    Adapter {
        /// Reading
        tadapt: i32,
        /// Limit
        max: i32,
    },
}

/// A change to the adapter output requested by a regulation step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Adjustment {
    /// Leave the adapter as it is
    Hold,
    /// Request this output voltage, mV
    Voltage(i32),
    /// Request this output current, mA
    Current(i32),
}

/// Tracks the adapter setpoints of a session.
#[derive(Debug, Clone)]
pub struct Regulator {
    config: RegulationConfig,
    vset: i32,
    iset: i32,
}

impl Regulator {
    /// Start from the initial setpoints for a battery at `vbat` behind a `ratio` converter.
    pub fn new(config: RegulationConfig, vbat: i32, ratio: i32) -> Self {
        let vset = (vbat * ratio + config.init_vset_offset_mv).min(config.vset_max_mv);
        let iset = config.init_iset_ma.min(config.iset_max_ma);
        Regulator { config, vset, iset }
    }

    /// Requested adapter voltage, mV
    pub fn vset(&self) -> i32 {
        self.vset
    }

    /// Requested adapter current, mA
    pub fn iset(&self) -> i32 {
        self.iset
    }

    /// Check the IC and adapter temperatures against their limits.
    pub fn check_temperature(&self, telemetry: &Telemetry) -> Result<(), OverTemp> {
        if let Some(tls) = telemetry.tls {
            if tls > self.config.max_tls {
                return Err(OverTemp::Ic {
                    tls,
                    max: self.config.max_tls,
                });
            }
        }
        if telemetry.tadapt > self.config.max_tadapt {
            return Err(OverTemp::Adapter {
                tadapt: telemetry.tadapt,
                max: self.config.max_tadapt,
            });
        }
        Ok(())
    }

    /// One regulation decision.
    ///
    /// A CV stage first pulls the voltage back by the battery overshoot. Any current above
    /// the ceiling steps the voltage down. Inside the dead band nothing changes. Below it
    /// the current request is raised in [`DC_CURRENT_STEP`] battery side steps, and once
    /// the request is at the ceiling the voltage is stepped up.
    pub fn step(
        &mut self,
        cv: bool,
        params: &ChargeParams,
        telemetry: &Telemetry,
        ratio: i32,
    ) -> Adjustment {
        if ratio <= 0 {
            error!("regulation ratio {}", ratio);
            return Adjustment::Hold;
        }
        let vstep = self.config.vstep_mv;
        let th_high = params.ibat_th_high;
        let Telemetry {
            vbat, ibat, iadapt, ..
        } = *telemetry;

        let adjustment = if cv && vbat > params.vbat_th {
            self.set_voltage(self.vset + ratio * (params.vbat_th - vbat))
        } else if iadapt > th_high / ratio || ibat > th_high {
            self.set_voltage(self.vset - vstep)
        } else if ibat > th_high - self.config.delta_err_ma {
            Adjustment::Hold
        } else {
            let iset_ceiling = (th_high / ratio).min(self.config.iset_max_ma);
            let istep = DC_CURRENT_STEP / ratio;
            if self.iset + istep < iset_ceiling {
                self.set_current(self.iset + istep)
            } else if self.iset < iset_ceiling {
                self.set_current(iset_ceiling)
            } else if iadapt < (th_high - self.config.delta_err_ma) / ratio {
                self.set_voltage(self.vset + vstep)
            } else {
                Adjustment::Hold
            }
        };

        debug!(
            "regulate cv={} vbat={} ibat={} iadp={} th={} -> {}",
            cv,
            vbat,
            ibat,
            iadapt,
            th_high,
            adjustment
        );
        adjustment
    }

    fn set_voltage(&mut self, mv: i32) -> Adjustment {
        let mv = mv.clamp(0, self.config.vset_max_mv);
        if mv == self.vset {
            return Adjustment::Hold;
        }
        self.vset = mv;
        Adjustment::Voltage(mv)
    }

    fn set_current(&mut self, ma: i32) -> Adjustment {
        let ma = ma.clamp(0, self.config.iset_max_ma);
        if ma == self.iset {
            return Adjustment::Hold;
        }
        self.iset = ma;
        Adjustment::Current(ma)
    }
}
