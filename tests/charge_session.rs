use core::cell::Cell;

use direct_charge_control::{
    run_control_loop, run_threshold_loop, run_watchdog_loop, AdapterDetector, AdapterOps,
    AdapterSupportMode, BatteryOps, ChargeSession, ChargerEvents, DetectConfig, DetectError,
    DiagnosticSink, FaultDomain, FaultLog, IcError, IcHandle, IcManager, IcOps, IcResult, IcSlot,
    IcTopology, Ping, PingError, PriorityEntry, Protocol, SessionConfig, SessionParts,
    SessionState, Tick, VoltPara, WorkingMode,
};
use embassy_futures::block_on;
use embassy_futures::join::join4;
use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::delay::DelayNs;

const MAIN: IcHandle = IcHandle::new(WorkingMode::Sc, IcSlot::Main);
const AUX: IcHandle = IcHandle::new(WorkingMode::Sc, IcSlot::Aux);

const PRIORITY: [PriorityEntry; 2] = [
    PriorityEntry::exclusive(Protocol::Ufcs),
    PriorityEntry::compatible(Protocol::Scp),
];

const LADDER: [VoltPara; 2] = [
    VoltPara {
        vol_th: 4200,
        cur_th_high: 6000,
        cur_th_low: 3000,
    },
    VoltPara {
        vol_th: 4450,
        cur_th_high: 3000,
        cur_th_low: 1000,
    },
];

struct Yield;

impl DelayNs for Yield {
    async fn delay_ns(&mut self, _ns: u32) {
        yield_now().await;
    }
}

#[derive(Default)]
struct Pump {
    ibus: Cell<i32>,
    enabled: Cell<bool>,
    kicks: Cell<u32>,
    watchdog_ms: Cell<u32>,
}

impl Pump {
    fn new(ibus: i32) -> Self {
        let pump = Pump::default();
        pump.ibus.set(ibus);
        pump
    }
}

struct PumpDriver<'r>(&'r Pump);

impl IcOps for PumpDriver<'_> {
    type Error = ();

    async fn init(&mut self) -> IcResult<(), ()> {
        Ok(())
    }

    async fn exit(&mut self) -> IcResult<(), ()> {
        Ok(())
    }

    async fn enable(&mut self, enable: bool) -> IcResult<(), ()> {
        self.0.enabled.set(enable);
        Ok(())
    }

    async fn get_ibus(&mut self) -> IcResult<i32, ()> {
        Ok(if self.0.enabled.get() { self.0.ibus.get() } else { 0 })
    }

    async fn get_vbus(&mut self) -> IcResult<i32, ()> {
        Ok(8000)
    }

    async fn kick_watchdog(&mut self) -> IcResult<(), ()> {
        self.0.kicks.set(self.0.kicks.get() + 1);
        Ok(())
    }

    async fn config_watchdog(&mut self, timeout_ms: u32) -> IcResult<(), ()> {
        self.0.watchdog_ms.set(timeout_ms);
        Ok(())
    }

    async fn get_temp(&mut self) -> IcResult<i32, ()> {
        Err(IcError::Unsupported)
    }
}

/// Speaks SCP only, with the modes given.
struct ScpAdapter {
    modes: AdapterSupportMode,
    vset: i32,
    iset: i32,
    defaults: u32,
}

impl ScpAdapter {
    fn new(modes: &[WorkingMode]) -> Self {
        ScpAdapter {
            modes: AdapterSupportMode::from_modes(modes),
            vset: 5000,
            iset: 0,
            defaults: 0,
        }
    }
}

impl AdapterOps for ScpAdapter {
    type Error = ();

    async fn ping(&mut self, protocol: Protocol) -> Result<Ping, PingError<()>> {
        match protocol {
            Protocol::Scp => Ok(Ping::Supported(self.modes)),
            _ => Ok(Ping::Unsupported),
        }
    }
    async fn reset_adapter(&mut self, _: Protocol) -> Result<(), ()> {
        Ok(())
    }
    async fn reset_protocol_master(&mut self, _: Protocol) -> Result<(), ()> {
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
        Ok(2000)
    }
    async fn get_max_current(&mut self) -> Result<i32, ()> {
        Ok(5000)
    }
    async fn get_temp(&mut self) -> Result<i32, ()> {
        Ok(30)
    }
    async fn set_default(&mut self) -> Result<(), ()> {
        self.defaults += 1;
        self.vset = 5000;
        Ok(())
    }
}

struct Gauge {
    vbat: i32,
    ibat: i32,
}

impl BatteryOps for Gauge {
    type Error = ();

    async fn get_vbat(&mut self) -> Result<i32, ()> {
        Ok(self.vbat)
    }
    async fn get_ibat(&mut self) -> Result<i32, ()> {
        Ok(self.ibat)
    }
    async fn get_temp(&mut self) -> Result<i32, ()> {
        Ok(25)
    }
}

#[derive(Default)]
struct Uploads {
    last: Option<(FaultDomain, u8)>,
    count: usize,
}

impl DiagnosticSink for Uploads {
    type Error = ();

    fn report(&mut self, domain: FaultDomain, code: u8, _text: &str) -> Result<(), ()> {
        self.last = Some((domain, code));
        self.count += 1;
        Ok(())
    }
}

fn config() -> SessionConfig {
    SessionConfig {
        ladder: heapless::Vec::from_slice(&LADDER).unwrap(),
        ..Default::default()
    }
}

fn registry<'r>(main: &'r Pump, aux: &'r Pump) -> IcManager<PumpDriver<'r>> {
    let mut ics = IcManager::new();
    ics.register(MAIN, PumpDriver(main)).unwrap();
    ics.register(AUX, PumpDriver(aux)).unwrap();
    ics
}

#[test]
fn detection_picks_the_shared_mode() {
    let events = ChargerEvents::new();
    events.charger_inserted();
    let mut adapter = ScpAdapter::new(&[WorkingMode::Lvc, WorkingMode::Sc, WorkingMode::Sc4]);

    let negotiation = block_on(
        AdapterDetector::new(&mut adapter, &events, DetectConfig::default())
            .detect_protocol(&PRIORITY, &mut Yield),
    )
    .unwrap();
    assert_eq!(negotiation.selected_protocol, Protocol::Scp);
    assert!(negotiation.runtime_protocol_mask.contains(Protocol::Scp));
    assert!(!negotiation.runtime_protocol_mask.contains(Protocol::Ufcs));

    // only SC ICs are fitted, so SC4 is not an option
    let (main, aux) = (Pump::new(1500), Pump::new(1500));
    let mut ics = registry(&main, &aux);
    let mut battery = Gauge {
        vbat: 3800,
        ibat: 3000,
    };
    let mut sink = Uploads::default();
    let mut log = FaultLog::new();
    let parts = SessionParts {
        ics: &mut ics,
        adapter: &mut adapter,
        battery: &mut battery,
        sink: &mut sink,
        log: &mut log,
        events: &events,
    };
    let session = block_on(ChargeSession::start(parts, &negotiation, config())).unwrap();
    assert_eq!(session.mode(), WorkingMode::Sc);
    assert_eq!(session.protocol(), Protocol::Scp);
    assert!(main.enabled.get());
}

#[test]
fn removed_cable_aborts_detection() {
    let events = ChargerEvents::new();
    events.charger_removed();
    let mut adapter = ScpAdapter::new(&[WorkingMode::Sc]);
    let result = block_on(
        AdapterDetector::new(&mut adapter, &events, DetectConfig::default())
            .detect_protocol(&PRIORITY, &mut Yield),
    );
    assert_eq!(result, Err(DetectError::PluggedOut));
}

#[test]
fn path_follows_the_bus_current() {
    let events = ChargerEvents::new();
    let mut adapter = ScpAdapter::new(&[WorkingMode::Sc]);
    let negotiation = block_on(
        AdapterDetector::new(&mut adapter, &events, DetectConfig::default())
            .detect_protocol(&PRIORITY, &mut Yield),
    )
    .unwrap();

    let (main, aux) = (Pump::new(2500), Pump::new(1200));
    let mut ics = registry(&main, &aux);
    let mut battery = Gauge {
        vbat: 3800,
        ibat: 5000,
    };
    let mut sink = Uploads::default();
    let mut log = FaultLog::new();
    let parts = SessionParts {
        ics: &mut ics,
        adapter: &mut adapter,
        battery: &mut battery,
        sink: &mut sink,
        log: &mut log,
        events: &events,
    };
    let mut session = block_on(ChargeSession::start(parts, &negotiation, config())).unwrap();

    // 2500 mA on the bus is 5000 mA at the battery, above the switch threshold
    for _ in 0..3 {
        assert!(matches!(
            block_on(session.control_tick(&mut Yield)),
            Tick::Continue(_)
        ));
    }
    assert_eq!(session.topology(), Some(IcTopology::Multi));
    assert!(aux.enabled.get());
    assert_eq!(session.info().ics[1].and_then(|i| i.ibus), Some(1200));

    events.set_force_single_path(true);
    block_on(session.control_tick(&mut Yield));
    assert_eq!(session.topology(), Some(IcTopology::Single(IcSlot::Main)));
    assert!(!aux.enabled.get());
    assert!(main.enabled.get());
    assert_eq!(session.multi_ic_error_count(), 0);
}

#[test]
fn cable_removal_stops_every_loop() {
    let events = ChargerEvents::new();
    events.charger_inserted();
    let mut adapter = ScpAdapter::new(&[WorkingMode::Sc]);
    let negotiation = block_on(
        AdapterDetector::new(&mut adapter, &events, DetectConfig::default())
            .detect_protocol(&PRIORITY, &mut Yield),
    )
    .unwrap();

    let (main, aux) = (Pump::new(1500), Pump::new(1500));
    let mut ics = registry(&main, &aux);
    let mut battery = Gauge {
        vbat: 3800,
        ibat: 3000,
    };
    let mut sink = Uploads::default();
    let mut log = FaultLog::new();
    let parts = SessionParts {
        ics: &mut ics,
        adapter: &mut adapter,
        battery: &mut battery,
        sink: &mut sink,
        log: &mut log,
        events: &events,
    };
    let session = block_on(ChargeSession::start(parts, &negotiation, config())).unwrap();
    let session = Mutex::<NoopRawMutex, _>::new(session);

    let unplug = async {
        for _ in 0..50 {
            yield_now().await;
        }
        events.charger_removed();
    };
    let (control, threshold, watchdog, ()) = block_on(join4(
        run_control_loop(&session, Yield),
        run_threshold_loop(&session, Yield),
        run_watchdog_loop(&session, Yield),
        unplug,
    ));
    assert_eq!(control, SessionState::Stopped);
    assert_eq!(threshold, SessionState::Stopped);
    assert_eq!(watchdog, SessionState::Stopped);

    assert!(main.kicks.get() > 0);
    assert!(!main.enabled.get());
    assert_eq!(main.watchdog_ms.get(), 0);
    drop(session);
    assert_eq!(adapter.defaults, 1);
    assert_eq!(adapter.vset, 5000);
    assert_eq!(sink.count, 0);
}
