//! Battery telemetry contract.

/// Upper bound of the end-of-charge voltage derating, in mV.
pub const VTERM_DEC_MAX: i32 = 100;
/// Lower bound of the charge current scaling, in percent.
pub const ICHG_RATIO_MIN: i32 = 70;
/// Charge current scaling that means "no derating", in percent.
pub const ICHG_RATIO_FULL: i32 = 100;

/// State-of-health derating applied to the stage ladder.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct SohLimits {
    /// Reduction of the final stage voltage, in mV
    pub vterm_dec: i32,
    /// Scaling of the first stage current, in percent
    pub ichg_ratio: i32,
}

impl SohLimits {
    /// No derating
    pub const NONE: SohLimits = SohLimits {
        vterm_dec: 0,
        ichg_ratio: ICHG_RATIO_FULL,
    };

    /// Limits forced into their valid ranges. A ratio of 0 means "unset".
    pub fn clamped(self) -> SohLimits {
        let ichg_ratio = match self.ichg_ratio {
            0 => ICHG_RATIO_FULL,
            r => r.clamp(ICHG_RATIO_MIN, ICHG_RATIO_FULL),
        };
        SohLimits {
            vterm_dec: self.vterm_dec.clamp(0, VTERM_DEC_MAX),
            ichg_ratio,
        }
    }
}

impl Default for SohLimits {
    fn default() -> Self {
        Self::NONE
    }
}

/// Battery gauge operations. Readings are side effect free.
#[allow(async_fn_in_trait)]
pub trait BatteryOps {
    /// Gauge error
    type Error;

    /// Battery voltage in mV
    async fn get_vbat(&mut self) -> Result<i32, Self::Error>;

    /// Battery current in mA, positive while charging
    async fn get_ibat(&mut self) -> Result<i32, Self::Error>;

    /// Battery temperature in °C
    async fn get_temp(&mut self) -> Result<i32, Self::Error>;

    /// Current state-of-health derating.
    fn soh_limits(&self) -> SohLimits {
        SohLimits::NONE
    }
}
