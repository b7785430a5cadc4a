//! Identifiers and packed flag words shared by every component.

use modular_bitfield::{bitfield, specifiers::B4, specifiers::B5};

/// Electrical topology class of a direct charge session.
///
/// Fixed for the lifetime of a session once selected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum WorkingMode {
    /// Low voltage direct charge, 1:1 load switch
    Lvc,
    /// Switched capacitor, 2:1 charge pump
    Sc,
    /// Switched capacitor, 4:1 charge pump
    Sc4,
}

impl WorkingMode {
    /// All modes, in ascending priority.
    pub const ALL: [WorkingMode; 3] = [WorkingMode::Lvc, WorkingMode::Sc, WorkingMode::Sc4];

    /// Nominal adapter-to-battery voltage conversion ratio.
    pub const fn volt_ratio(self) -> i32 {
        match self {
            WorkingMode::Lvc => 1,
            WorkingMode::Sc => 2,
            WorkingMode::Sc4 => 4,
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            WorkingMode::Lvc => 0,
            WorkingMode::Sc => 1,
            WorkingMode::Sc4 => 2,
        }
    }
}

/// Logical IC position within a working mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum IcSlot {
    /// The primary charge pump, always used first
    Main,
    /// The secondary charge pump, only used in multi path
    Aux,
}

impl IcSlot {
    /// The slot on the opposite side of the path.
    pub const fn other(self) -> IcSlot {
        match self {
            IcSlot::Main => IcSlot::Aux,
            IcSlot::Aux => IcSlot::Main,
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            IcSlot::Main => 0,
            IcSlot::Aux => 1,
        }
    }
}

/// Identifies one physical charge pump by working mode and slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct IcHandle {
    /// Working mode the IC serves
    pub mode: WorkingMode,
    /// Position within that mode
    pub slot: IcSlot,
}

impl IcHandle {
    /// Create a new `IcHandle`
    pub const fn new(mode: WorkingMode, slot: IcSlot) -> Self {
        IcHandle { mode, slot }
    }
}

/// Which IC(s) are currently driving charge current.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum IcTopology {
    /// Exactly one IC enabled
    Single(IcSlot),
    /// Both ICs enabled in parallel
    Multi,
}

/// Fast charge adapter protocols that can be probed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum Protocol {
    /// Super charge protocol
    Scp,
    /// Fast charge protocol
    Fcp,
    /// USB power delivery
    Pd,
    /// Universal fast charging specification
    Ufcs,
}

#[bitfield(bits = 8)]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// A set of adapter protocols
pub struct ProtocolMask {
    pub scp: bool,
    pub fcp: bool,
    pub pd: bool,
    pub ufcs: bool,
    #[skip]
    __: B4,
}

impl ProtocolMask {
    /// Add `protocol` to the set.
    pub fn insert(&mut self, protocol: Protocol) {
        match protocol {
            Protocol::Scp => self.set_scp(true),
            Protocol::Fcp => self.set_fcp(true),
            Protocol::Pd => self.set_pd(true),
            Protocol::Ufcs => self.set_ufcs(true),
        }
    }

    /// Is `protocol` in the set?
    pub fn contains(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Scp => self.scp(),
            Protocol::Fcp => self.fcp(),
            Protocol::Pd => self.pd(),
            Protocol::Ufcs => self.ufcs(),
        }
    }

    /// Is the set empty?
    pub fn is_empty(&self) -> bool {
        self.bits() == 0
    }

    /// Raw bit representation
    pub fn bits(&self) -> u8 {
        self.into_bytes()[0]
    }

    /// Is every protocol in `self` also in `other`?
    pub fn is_subset_of(&self, other: &ProtocolMask) -> bool {
        self.bits() & !other.bits() == 0
    }
}

#[bitfield(bits = 8)]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// Direct charge modes an adapter (or the local platform) can support
pub struct AdapterSupportMode {
    pub lvc: bool,
    pub sc: bool,
    pub sc4: bool,
    #[skip]
    __: B5,
}

impl AdapterSupportMode {
    /// A set holding exactly the given modes.
    pub fn from_modes(modes: &[WorkingMode]) -> Self {
        let mut set = AdapterSupportMode::new();
        for &mode in modes {
            set.insert(mode);
        }
        set
    }

    /// Add `mode` to the set.
    pub fn insert(&mut self, mode: WorkingMode) {
        match mode {
            WorkingMode::Lvc => self.set_lvc(true),
            WorkingMode::Sc => self.set_sc(true),
            WorkingMode::Sc4 => self.set_sc4(true),
        }
    }

    /// Is `mode` in the set?
    pub fn supports(&self, mode: WorkingMode) -> bool {
        match mode {
            WorkingMode::Lvc => self.lvc(),
            WorkingMode::Sc => self.sc(),
            WorkingMode::Sc4 => self.sc4(),
        }
    }

    /// Modes present in both sets
    pub fn intersect(&self, other: &AdapterSupportMode) -> AdapterSupportMode {
        AdapterSupportMode::from_bytes([self.into_bytes()[0] & other.into_bytes()[0]])
    }

    /// Modes present in either set
    pub fn union(&self, other: &AdapterSupportMode) -> AdapterSupportMode {
        AdapterSupportMode::from_bytes([self.into_bytes()[0] | other.into_bytes()[0]])
    }
}

/// Pick the highest priority mode that both sides support: SC4, then SC, then LVC.
pub fn select_working_mode(
    adapter: AdapterSupportMode,
    local: AdapterSupportMode,
) -> Option<WorkingMode> {
    let common = adapter.intersect(&local);
    WorkingMode::ALL
        .iter()
        .rev()
        .copied()
        .find(|&mode| common.supports(mode))
}

#[bitfield(bits = 8)]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// Session stop conditions. Any set flag forces the control loop into `Stopped`.
pub struct FaultFlags {
    /// An error was detected and recorded
    pub stop_on_error: bool,
    /// Charging conditions (e.g. battery temperature) do not permit direct charge
    pub stop_on_scp_info: bool,
    /// Direct charge disabled by the system
    pub force_disable: bool,
    #[skip]
    __: B5,
}

impl FaultFlags {
    /// Is any stop condition raised?
    pub fn any(&self) -> bool {
        self.into_bytes()[0] != 0
    }
}

#[bitfield(bits = 8)]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// Latched protection status reported by a charge pump
pub struct IcStatus {
    pub vbus_ovp: bool,
    pub ibus_ocp: bool,
    pub vbat_ovp: bool,
    pub ibat_ocp: bool,
    pub die_otp: bool,
    pub watchdog_expired: bool,
    pub reverse_current: bool,
    pub converter_ocp: bool,
}

impl IcStatus {
    /// Is any protection latched?
    pub fn has_fault(&self) -> bool {
        self.into_bytes()[0] != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_mask_membership() {
        let mut mask = ProtocolMask::new();
        assert!(mask.is_empty());
        mask.insert(Protocol::Ufcs);
        mask.insert(Protocol::Scp);
        assert!(mask.contains(Protocol::Ufcs));
        assert!(mask.contains(Protocol::Scp));
        assert!(!mask.contains(Protocol::Pd));
        assert_eq!(mask.bits(), 0b1001);

        let all = ProtocolMask::from_bytes([0x0f]);
        assert!(mask.is_subset_of(&all));
        assert!(!all.is_subset_of(&mask));
    }

    #[test]
    fn working_mode_prefers_highest_common() {
        let adapter = AdapterSupportMode::from_modes(&[WorkingMode::Lvc, WorkingMode::Sc]);
        let local = AdapterSupportMode::from_modes(&WorkingMode::ALL);
        assert_eq!(select_working_mode(adapter, local), Some(WorkingMode::Sc));

        let local = AdapterSupportMode::from_modes(&[WorkingMode::Lvc, WorkingMode::Sc4]);
        assert_eq!(select_working_mode(adapter, local), Some(WorkingMode::Lvc));

        let local = AdapterSupportMode::from_modes(&[WorkingMode::Sc4]);
        assert_eq!(select_working_mode(adapter, local), None);
    }

    #[test]
    fn fault_flags_any() {
        let mut flags = FaultFlags::new();
        assert!(!flags.any());
        flags.set_force_disable(true);
        assert!(flags.any());
    }

    #[test]
    fn ic_status_fault() {
        assert!(!IcStatus::new().has_fault());
        assert!(IcStatus::new().with_die_otp(true).has_fault());
    }
}
