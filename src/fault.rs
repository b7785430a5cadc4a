//! Fault classification and the bounded diagnostic text buffer.

use core::fmt::Write;

use heapless::String;

/// Capacity of the diagnostic buffer
pub const FAULT_LOG_SIZE: usize = 2048;

/// Bytes that must remain free before a record is appended. Also the longest record.
pub const FAULT_LOG_RESERVE: usize = 128;

/// Subsystem a fault originates from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum FaultDomain {
    /// Battery gauge and battery telemetry
    Battery,
    /// Charge pump ICs
    Ic,
    /// External adapter
    Adapter,
    /// Session sequencing
    Charging,
}

impl FaultDomain {
    /// Short tag used in the text record
    pub const fn tag(self) -> &'static str {
        match self {
            FaultDomain::Battery => "bat",
            FaultDomain::Ic => "ic",
            FaultDomain::Adapter => "adp",
            FaultDomain::Charging => "dc",
        }
    }

    const fn descriptions(self) -> &'static [&'static str] {
        match self {
            FaultDomain::Battery => BATTERY_DESC,
            FaultDomain::Ic => IC_DESC,
            FaultDomain::Adapter => ADAPTER_DESC,
            FaultDomain::Charging => CHARGING_DESC,
        }
    }

    /// Number of valid codes in this domain
    pub const fn code_count(self) -> u8 {
        self.descriptions().len() as u8
    }

    /// Description of `code`, or `None` if the code is outside this domain's range.
    pub fn describe(self, code: u8) -> Option<&'static str> {
        self.descriptions().get(code as usize).copied()
    }
}

macro_rules! fault_codes {
    ($(#[$meta:meta])* $name:ident, $desc:ident, $domain:expr, { $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        #[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        const $desc: &[&str] = &[$($text),+];

        impl From<$name> for Fault {
            fn from(code: $name) -> Fault {
                Fault { domain: $domain, code: code as u8 }
            }
        }
    };
}

fault_codes!(
    /// Battery domain fault codes
    BatteryFault, BATTERY_DESC, FaultDomain::Battery, {
        /// Battery voltage read failed
        GetVbat => "get vbat fail",
        /// Battery current read failed
        GetIbat => "get ibat fail",
        /// Charge current stayed below the expected floor
        IbatAbnormal => "ibat abnormal",
    }
);

fault_codes!(
    /// IC domain fault codes
    IcFault, IC_DESC, FaultDomain::Ic, {
        /// Bus current read failed
        GetIbus => "get ibus fail",
        /// Bus voltage read failed
        GetVbus => "get vbus fail",
        /// Die temperature read failed
        GetTemp => "get temp fail",
        /// Die temperature above the limit
        TlsAbnormal => "tls abnormal",
        /// A paralleled IC did not carry current
        MultiIcCurrent => "multi ic current abnormal",
        /// Initialization failed
        Init => "init fail",
        /// Enable or disable failed
        Enable => "enable fail",
        /// Watchdog configuration failed
        Watchdog => "watchdog fail",
    }
);

fault_codes!(
    /// Adapter domain fault codes
    AdapterFault, ADAPTER_DESC, FaultDomain::Adapter, {
        /// Output voltage read failed
        GetVapt => "get adapter voltage fail",
        /// Output current read failed
        GetIapt => "get adapter current fail",
        /// Adapter temperature read failed
        GetTemp => "get adapter temp fail",
        /// Output voltage request rejected
        SetVolt => "set adapter voltage fail",
        /// Output current request rejected
        SetCurr => "set adapter current fail",
        /// Adapter temperature above the limit
        TadpAbnormal => "tadapt abnormal",
    }
);

fault_codes!(
    /// Charging sequencing fault codes
    ChargingFault, CHARGING_DESC, FaultDomain::Charging, {
        /// Session start failed
        InitDirectCharge => "init direct charge fail",
        /// The charge path did not open
        OpenPath => "open path fail",
        /// Battery temperature out of the direct charge window
        BatteryTemp => "battery temp out of range",
        /// Teardown step failed
        Teardown => "teardown fail",
    }
);

/// A validated `(domain, code)` pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct Fault {
    domain: FaultDomain,
    code: u8,
}

impl Fault {
    /// Validate a raw code against its domain.
    pub fn from_raw(domain: FaultDomain, code: u8) -> Option<Fault> {
        domain.describe(code).map(|_| Fault { domain, code })
    }

    /// Originating domain
    pub fn domain(&self) -> FaultDomain {
        self.domain
    }

    /// Code within the domain
    pub fn code(&self) -> u8 {
        self.code
    }

    /// Static description of the code
    pub fn description(&self) -> &'static str {
        self.domain.describe(self.code).unwrap_or("")
    }
}

/// A fault occurrence with free text detail.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FaultRecord<'d> {
    /// Domain and code
    pub fault: Fault,
    /// Context, e.g. the offending reading
    pub detail: &'d str,
}

/// Why a record was not appended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub enum FaultLogError {
    /// The code is outside the domain's range
    InvalidCode(FaultDomain, u8),
    /// Not enough room left in the buffer, or the record is longer than the reserve
    InsufficientSpace,
}

/// Flushing the buffer to the sink failed. The buffer is kept.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
pub struct FlushError<E>(pub E);

/// External collaborator that uploads diagnostics.
pub trait DiagnosticSink {
    /// Sink specific error
    type Error;

    /// Hand over a diagnostic text tagged with the most recent fault.
    fn report(&mut self, domain: FaultDomain, code: u8, text: &str) -> Result<(), Self::Error>;
}

/// Bounded, append-only diagnostic text buffer.
#[derive(Debug, Default)]
pub struct FaultLog<const N: usize = FAULT_LOG_SIZE> {
    buf: String<N>,
    last: Option<Fault>,
    pending: usize,
}

impl<const N: usize> FaultLog<N> {
    /// Create an empty log
    pub const fn new() -> Self {
        FaultLog {
            buf: String::new(),
            last: None,
            pending: 0,
        }
    }

    /// Append a record for a raw `(domain, code)` pair.
    ///
    /// Out of range codes are rejected. A record is only appended whole, and only while at
    /// least [`FAULT_LOG_RESERVE`] bytes remain free; otherwise it is logged locally and
    /// dropped.
    pub fn append_fault(
        &mut self,
        domain: FaultDomain,
        code: u8,
        detail: &str,
    ) -> Result<(), FaultLogError> {
        let Some(fault) = Fault::from_raw(domain, code) else {
            error!("fault code {} out of range for {}", code, domain);
            return Err(FaultLogError::InvalidCode(domain, code));
        };
        self.record(FaultRecord { fault, detail })
    }

    /// Append a validated record.
    pub fn record(&mut self, record: FaultRecord<'_>) -> Result<(), FaultLogError> {
        let mut line: String<FAULT_LOG_RESERVE> = String::new();
        let formatted = writeln!(
            line,
            "{} {}: {}",
            record.fault.domain.tag(),
            record.fault.description(),
            record.detail
        );

        let remaining = N - self.buf.len();
        if formatted.is_err() || remaining < FAULT_LOG_RESERVE || line.len() > remaining {
            warn!(
                "fault log full, dropped {} {}",
                record.fault.domain,
                record.fault.code
            );
            return Err(FaultLogError::InsufficientSpace);
        }

        self.buf
            .push_str(&line)
            .map_err(|_| FaultLogError::InsufficientSpace)?;
        self.last = Some(record.fault);
        self.pending += 1;
        Ok(())
    }

    /// Hand the buffer to `sink` and clear it on success.
    ///
    /// A failed flush keeps the buffer so the next fault can retry. Flushing an empty log
    /// does nothing.
    pub fn flush<S: DiagnosticSink>(&mut self, sink: &mut S) -> Result<(), FlushError<S::Error>> {
        let Some(last) = self.last else {
            return Ok(());
        };
        sink.report(last.domain, last.code, &self.buf)
            .map_err(FlushError)?;
        info!("flushed {} fault records", self.pending);
        self.clear();
        Ok(())
    }

    /// Buffered text
    pub fn as_str(&self) -> &str {
        &self.buf
    }

    /// Records appended since the last flush
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Is the buffer empty?
    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.last = None;
        self.pending = 0;
    }
}
