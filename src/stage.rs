//! The voltage/current stage ladder and charging threshold derivation.
//!
//! Each ladder entry contributes two sub-stages: a constant current stage (`2i`) and a
//! constant voltage stage (`2i + 1`). Stage `2 * count` is terminal.

use heapless::Vec;

use crate::battery::{SohLimits, ICHG_RATIO_FULL};

/// Maximum number of ladder entries
pub const DC_VOLT_LEVEL: usize = 8;
/// Maximum number of battery temperature bands
pub const DC_TEMP_LEVEL: usize = 5;

const MAX_JUMP_STAGES: usize = 2 * DC_VOLT_LEVEL;

/// One ladder entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct VoltPara {
    /// Battery voltage that ends this entry's CC stage, in mV
    pub vol_th: i32,
    /// Charge current ceiling, in mA
    pub cur_th_high: i32,
    /// Charge current that ends this entry's CV stage, in mA
    pub cur_th_low: i32,
}

/// A battery temperature band and the charge current allowed in it.
///
/// The band covers `temp_min <= t < temp_max`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct TempBand {
    /// Inclusive lower bound in °C
    pub temp_min: i32,
    /// Exclusive upper bound in °C
    pub temp_max: i32,
    /// Current limit in mA. `0` forbids direct charge.
    pub cur_max: i32,
}

/// Current limit for `tbat`. Temperatures outside every band yield `0`.
pub fn temp_band_limit(bands: &[TempBand], tbat: i32) -> i32 {
    bands
        .iter()
        .find(|b| tbat >= b.temp_min && tbat < b.temp_max)
        .map_or(0, |b| b.cur_max)
}

/// The ladder could not be built.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum LadderError {
    /// No entries
    Empty,
    /// More than [`DC_VOLT_LEVEL`] entries, or too many jump stages
    TooLarge,
    /// Voltage thresholds are not ascending, or a current threshold is inverted
    Unordered,
}

/// A session's stage ladder.
///
/// The stage index only ever moves forward.
#[derive(Debug, Clone)]
pub struct StageLadder {
    orig: Vec<VoltPara, DC_VOLT_LEVEL>,
    para: Vec<VoltPara, DC_VOLT_LEVEL>,
    jump: Vec<usize, MAX_JUMP_STAGES>,
    first_cc_limit_ms: Option<u32>,
    stage: usize,
}

impl StageLadder {
    /// Build a ladder from `entries`, lowest voltage first.
    pub fn new(entries: &[VoltPara]) -> Result<Self, LadderError> {
        if entries.is_empty() {
            return Err(LadderError::Empty);
        }
        let orig = Vec::from_slice(entries).map_err(|_| LadderError::TooLarge)?;
        let ordered = entries.windows(2).all(|w| w[0].vol_th <= w[1].vol_th)
            && entries.iter().all(|e| e.cur_th_low <= e.cur_th_high);
        if !ordered {
            return Err(LadderError::Unordered);
        }
        Ok(StageLadder {
            para: orig.clone(),
            orig,
            jump: Vec::new(),
            first_cc_limit_ms: None,
            stage: 0,
        })
    }

    /// Sub-stages that are skipped whenever selection lands on them.
    pub fn with_jump_stages(mut self, stages: &[usize]) -> Result<Self, LadderError> {
        self.jump = Vec::from_slice(stages).map_err(|_| LadderError::TooLarge)?;
        Ok(self)
    }

    /// Force stage 2 once the first CC/CV pair has run for `limit_ms`.
    pub fn with_first_cc_limit(mut self, limit_ms: u32) -> Self {
        self.first_cc_limit_ms = Some(limit_ms);
        self
    }

    /// Number of entries
    pub fn count(&self) -> usize {
        self.para.len()
    }

    /// Current sub-stage index
    pub fn stage(&self) -> usize {
        self.stage
    }

    /// Index at which charging is complete
    pub fn terminal_stage(&self) -> usize {
        2 * self.count()
    }

    /// Has the ladder been climbed to the end?
    pub fn is_terminal(&self) -> bool {
        self.stage >= self.terminal_stage()
    }

    /// Is the current sub-stage a constant voltage stage?
    pub fn is_cv(&self) -> bool {
        self.stage % 2 == 1
    }

    /// Effective (derated) entries
    pub fn entries(&self) -> &[VoltPara] {
        &self.para
    }

    /// Entry governing the current sub-stage. The terminal stage reuses the last entry.
    pub fn current(&self) -> &VoltPara {
        let last = self.para.len() - 1;
        &self.para[(self.stage / 2).min(last)]
    }

    fn last(&self) -> &VoltPara {
        &self.para[self.para.len() - 1]
    }

    /// Voltage threshold for entry `i` with IR compensation, capped at the final voltage.
    fn compensated_vol_th(&self, i: usize, compensate_mv: i32) -> i32 {
        (self.para[i].vol_th + compensate_mv).min(self.last().vol_th)
    }

    /// Re-derive the effective entries from the configured ones under `limits`.
    ///
    /// Returns `true` when any threshold changed.
    pub fn apply_soh(&mut self, limits: SohLimits) -> bool {
        let limits = limits.clamped();
        let last = self.orig.len() - 1;
        let volt_max = self.orig[last].vol_th - limits.vterm_dec;
        let cur_max = self.orig[0].cur_th_high * limits.ichg_ratio / ICHG_RATIO_FULL;

        let mut changed = false;
        for (i, (para, orig)) in self.para.iter_mut().zip(self.orig.iter()).enumerate() {
            let derated = VoltPara {
                vol_th: if i == last {
                    volt_max
                } else {
                    orig.vol_th.min(volt_max)
                },
                cur_th_high: if i == 0 {
                    cur_max
                } else {
                    orig.cur_th_high.min(cur_max)
                },
                cur_th_low: orig.cur_th_low,
            };
            changed |= *para != derated;
            *para = derated;
        }

        if changed {
            info!(
                "soh derating vterm_dec={} ichg_ratio={}",
                limits.vterm_dec,
                limits.ichg_ratio
            );
        }
        changed
    }

    /// Pick the sub-stage for the present battery state and advance to it.
    ///
    /// The search runs from the top entry down: `vbat` at or above an entry's threshold
    /// selects its CV stage, or the following CC stage once `ibat` has tapered to
    /// `cur_th_low`. The result never goes below the current stage, skips jump stages and
    /// is capped at the terminal stage.
    pub fn select(&mut self, vbat: i32, ibat: i32, compensate_mv: i32, elapsed_ms: u32) -> usize {
        let mut stage = (0..self.count())
            .rev()
            .find_map(|i| {
                let vbat_th = self.compensated_vol_th(i, compensate_mv);
                if vbat < vbat_th {
                    None
                } else if ibat <= self.para[i].cur_th_low {
                    Some(2 * i + 2)
                } else {
                    Some(2 * i + 1)
                }
            })
            .unwrap_or(0);

        stage = stage.max(self.stage);

        if let Some(limit) = self.first_cc_limit_ms {
            if stage < 2 && elapsed_ms >= limit {
                info!("first cc stage ran {} ms, moving on", elapsed_ms);
                stage = 2;
            }
        }

        if stage != self.stage {
            while self.jump.contains(&stage) {
                debug!("jump over stage {}", stage);
                stage += 1;
            }
            stage = stage.min(self.terminal_stage());
            info!("stage {} -> {}", self.stage, stage);
            self.stage = stage;
        }
        self.stage
    }
}

/// Inputs to the threshold derivation that come from outside the ladder.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct ParamInputs {
    /// Battery current, mA
    pub ibat: i32,
    /// Battery temperature, °C
    pub tbat: i32,
    /// Charge path resistance used for IR compensation, mΩ
    pub compensate_r_mohm: i32,
    /// Adapter's advertised current ceiling, mA
    pub adapter_max_ma: i32,
    /// Adapter to battery voltage ratio of the working mode
    pub volt_ratio: i32,
    /// Are both ICs carrying current?
    pub multi_path: bool,
    /// Ceiling for a single IC, mA
    pub single_ic_limit_ma: i32,
}

/// Thresholds the regulation step works against.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct ChargeParams {
    /// IR compensation, mV
    pub compensate_mv: i32,
    /// Battery voltage ceiling, mV
    pub vbat_th: i32,
    /// Battery current ceiling, mA
    pub ibat_th_high: i32,
    /// Battery current floor of the current entry, mA
    pub ibat_th_low: i32,
    /// `false` when the battery temperature forbids direct charge
    pub temp_allowed: bool,
}

/// IR compensation in mV for `ibat` (mA) across `r` (mΩ).
pub fn compensation_mv(ibat: i32, r_mohm: i32) -> i32 {
    ibat * r_mohm / 1000
}

impl StageLadder {
    /// Thresholds for the current sub-stage.
    ///
    /// The current ceiling is the smallest of the stage value, the temperature band limit,
    /// what the adapter can deliver through the conversion ratio, and the single IC limit
    /// when only one IC is active.
    pub fn params(&self, inputs: &ParamInputs, bands: &[TempBand]) -> ChargeParams {
        let compensate_mv = compensation_mv(inputs.ibat, inputs.compensate_r_mohm);
        let entry = self.current();
        let vbat_th = (entry.vol_th + compensate_mv).min(self.last().vol_th);

        let tbat_max = temp_band_limit(bands, inputs.tbat);
        let mut ibat_th_high = entry
            .cur_th_high
            .min(tbat_max)
            .min(inputs.adapter_max_ma.saturating_mul(inputs.volt_ratio));
        if !inputs.multi_path {
            ibat_th_high = ibat_th_high.min(inputs.single_ic_limit_ma);
        }

        if tbat_max == 0 {
            warn!("tbat={} outside direct charge bands", inputs.tbat);
        }

        ChargeParams {
            compensate_mv,
            vbat_th,
            ibat_th_high,
            ibat_th_low: entry.cur_th_low,
            temp_allowed: tbat_max != 0,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const LADDER: [VoltPara; 3] = [
        VoltPara {
            vol_th: 4100,
            cur_th_high: 6000,
            cur_th_low: 4000,
        },
        VoltPara {
            vol_th: 4300,
            cur_th_high: 4000,
            cur_th_low: 2500,
        },
        VoltPara {
            vol_th: 4450,
            cur_th_high: 2500,
            cur_th_low: 1000,
        },
    ];

    pub(crate) const BANDS: [TempBand; 3] = [
        TempBand {
            temp_min: 10,
            temp_max: 20,
            cur_max: 3000,
        },
        TempBand {
            temp_min: 20,
            temp_max: 45,
            cur_max: 8000,
        },
        TempBand {
            temp_min: 45,
            temp_max: 50,
            cur_max: 0,
        },
    ];

    #[test]
    fn rejects_bad_ladders() {
        assert_eq!(StageLadder::new(&[]).err(), Some(LadderError::Empty));
        assert_eq!(
            StageLadder::new(&[LADDER[0]; DC_VOLT_LEVEL + 1]).err(),
            Some(LadderError::TooLarge)
        );
        assert_eq!(
            StageLadder::new(&[LADDER[1], LADDER[0]]).err(),
            Some(LadderError::Unordered)
        );
    }

    #[test]
    fn stage_follows_battery_and_never_goes_back() {
        let mut ladder = StageLadder::new(&LADDER).unwrap();
        assert_eq!(ladder.select(3800, 6000, 0, 0), 0);
        assert_eq!(ladder.select(4150, 5000, 0, 0), 1);
        assert!(ladder.is_cv());
        assert_eq!(ladder.select(4150, 3900, 0, 0), 2);
        // a sagging battery voltage does not move the ladder back
        assert_eq!(ladder.select(3900, 3900, 0, 0), 2);
        assert_eq!(ladder.select(4460, 2000, 0, 0), 5);
        assert!(!ladder.is_terminal());
        assert_eq!(ladder.select(4460, 900, 0, 0), 6);
        assert!(ladder.is_terminal());
        assert_eq!(ladder.current(), &LADDER[2]);
    }

    #[test]
    fn compensation_is_capped_at_final_voltage() {
        let mut ladder = StageLadder::new(&LADDER).unwrap();
        // entry 1 would need 4500 but is capped at 4450, so only entry 0 matches
        assert_eq!(ladder.select(4440, 3000, 200, 0), 2);
        assert_eq!(ladder.select(4450, 3000, 200, 0), 5);
    }

    #[test]
    fn jump_stages_are_skipped() {
        let mut ladder = StageLadder::new(&LADDER)
            .unwrap()
            .with_jump_stages(&[1, 2])
            .unwrap();
        assert_eq!(ladder.select(4150, 5000, 0, 0), 3);

        let mut ladder = StageLadder::new(&LADDER)
            .unwrap()
            .with_jump_stages(&[5])
            .unwrap();
        assert_eq!(ladder.select(4460, 2000, 0, 0), 6);
        assert!(ladder.is_terminal());
    }

    #[test]
    fn first_cc_timer() {
        let mut ladder = StageLadder::new(&LADDER).unwrap().with_first_cc_limit(60_000);
        assert_eq!(ladder.select(3800, 6000, 0, 59_999), 0);
        assert_eq!(ladder.select(3800, 6000, 0, 60_000), 2);
    }

    #[test]
    fn soh_derates_from_configured_values() {
        let mut ladder = StageLadder::new(&LADDER).unwrap();
        assert!(!ladder.apply_soh(SohLimits::NONE));

        let limits = SohLimits {
            vterm_dec: 200,
            ichg_ratio: 50,
        };
        assert!(ladder.apply_soh(limits));
        // clamped to 100 mV and 70 %
        assert_eq!(ladder.entries()[2].vol_th, 4350);
        assert_eq!(ladder.entries()[1].vol_th, 4300);
        assert_eq!(ladder.entries()[0].cur_th_high, 4200);
        assert_eq!(ladder.entries()[1].cur_th_high, 4000);
        assert_eq!(ladder.entries()[2].cur_th_high, 2500);

        // derating does not accumulate
        assert!(!ladder.apply_soh(limits));
        assert!(ladder.apply_soh(SohLimits::NONE));
        assert_eq!(ladder.entries(), &LADDER);
    }

    #[test]
    fn params_take_the_tightest_limit() {
        let ladder = StageLadder::new(&LADDER).unwrap();
        let mut inputs = ParamInputs {
            ibat: 5000,
            tbat: 25,
            compensate_r_mohm: 20,
            adapter_max_ma: 5000,
            volt_ratio: 2,
            multi_path: true,
            single_ic_limit_ma: 8000,
        };
        let params = ladder.params(&inputs, &BANDS);
        assert_eq!(params.compensate_mv, 100);
        assert_eq!(params.vbat_th, 4200);
        assert_eq!(params.ibat_th_high, 6000);
        assert_eq!(params.ibat_th_low, 4000);
        assert!(params.temp_allowed);

        inputs.tbat = 15;
        assert_eq!(ladder.params(&inputs, &BANDS).ibat_th_high, 3000);

        inputs.tbat = 25;
        inputs.adapter_max_ma = 2000;
        assert_eq!(ladder.params(&inputs, &BANDS).ibat_th_high, 4000);

        inputs.adapter_max_ma = 5000;
        inputs.multi_path = false;
        inputs.single_ic_limit_ma = 3500;
        assert_eq!(ladder.params(&inputs, &BANDS).ibat_th_high, 3500);

        inputs.tbat = 46;
        let params = ladder.params(&inputs, &BANDS);
        assert!(!params.temp_allowed);
        assert_eq!(params.ibat_th_high, 0);

        inputs.tbat = 60;
        assert!(!ladder.params(&inputs, &BANDS).temp_allowed);
    }
}
