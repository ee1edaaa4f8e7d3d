//! End-to-end sessions: the real dispatcher on one thread, the real client on
//! another, connected by an in-memory pipe.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use eeflash::bridge::{DeviceLink, Stage};
use eeflash::programmer::Mismatch;
use eeflash::{
    CancelToken, Command, Dispatch, Dispatcher, Error, Outcome, PipePort, Programmer,
    ProgrammerConfig, SessionState, SimulatedEeprom,
};

type Bridge = JoinHandle<(SimulatedEeprom, Vec<Dispatch>)>;

fn config() -> ProgrammerConfig {
    ProgrammerConfig::default()
        .with_timeout(Duration::from_secs(2))
        .with_drain_grace(Duration::from_millis(50))
}

fn serve<L>(link: L, bus: SimulatedEeprom) -> (SimulatedEeprom, Vec<Dispatch>)
where
    L: DeviceLink,
{
    let mut dispatcher = Dispatcher::new(link, bus).with_settle_delay(Duration::ZERO);
    let mut served = Vec::new();
    dispatcher
        .run_with(|d| served.push(d.clone()))
        .unwrap();
    let (_, bus) = dispatcher.into_parts();
    (bus, served)
}

fn start(bus: SimulatedEeprom) -> (Programmer<PipePort>, Bridge) {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
    let (host, bridge) = PipePort::pair();
    let handle = thread::spawn(move || serve(bridge, bus));
    (Programmer::with_config(host, config()), handle)
}

fn finish(programmer: Programmer<PipePort>, bridge: Bridge) -> (SimulatedEeprom, Vec<Dispatch>) {
    drop(programmer);
    bridge
        .join()
        .unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i * 31 + i / 256) as u8)
        .collect()
}

/// Passes the first `budget` reply bytes, then goes silent.
struct Muted {
    link: PipePort,
    budget: usize,
}

impl DeviceLink for Muted {
    fn read_byte(&mut self) -> eeflash::Result<u8> {
        self.link
            .read_byte()
    }

    fn write_bytes(&mut self, data: &[u8]) -> eeflash::Result<()> {
        let n = data.len().min(self.budget);
        self.budget -= n;
        self.link
            .write_bytes(&data[..n])
    }

    fn flush(&mut self) -> eeflash::Result<()> {
        self.link
            .flush()
    }
}

#[test]
fn signature_over_loopback() {
    let (mut programmer, bridge) = start(SimulatedEeprom::default());
    let version = programmer
        .signature()
        .unwrap();
    assert_eq!(version.to_string(), "0.1.0");
    assert_eq!(programmer.firmware_version(), Some(version));

    let (_, served) = finish(programmer, bridge);
    assert_eq!(served.len(), 1);
    assert_eq!(served[0].outcome, Outcome::Signed);
}

#[test]
fn clean_two_unit_write() {
    let image = pattern(512);
    let (mut programmer, bridge) = start(SimulatedEeprom::default());
    let report = programmer
        .write_image(&image, |_, _| {})
        .unwrap();
    assert!(report.is_clean());
    assert_eq!(report.page_units, 2);
    assert_eq!(programmer.state(), SessionState::Complete);

    let (bus, served) = finish(programmer, bridge);
    assert_eq!(
        bus.page_programs()
            .len(),
        8
    );
    assert_eq!(bus.settles(), 8);
    assert_eq!(&bus.contents()[..512], image.as_slice());
    assert_eq!(
        served
            .last()
            .map(|d| d.outcome.clone()),
        Some(Outcome::Programmed {
            page_units: 2,
            byte_errors: 0
        })
    );
}

#[test]
fn write_then_dump_round_trips() {
    let (mut programmer, bridge) = start(SimulatedEeprom::default());
    for len in [256, 768, 4096, 0x8000] {
        let image = pattern(len);
        let report = programmer
            .write_image(&image, |_, _| {})
            .unwrap();
        assert!(report.is_clean(), "write of {len} bytes");

        let dumped = programmer
            .dump(len, |_, _| {})
            .unwrap();
        assert_eq!(dumped, image, "dump of {len} bytes");
    }
    finish(programmer, bridge);
}

#[test]
fn image_bytes_shaped_like_protection_commands_round_trip() {
    let mut image = vec![0xAA; 0x8000];
    image[0x2AAA] = 0x55;
    let (mut programmer, bridge) = start(SimulatedEeprom::default());
    let report = programmer
        .write_image(&image, |_, _| {})
        .unwrap();
    assert!(report.is_clean(), "{:?}", report.device_errors);

    let dumped = programmer
        .dump(image.len(), |_, _| {})
        .unwrap();
    assert_eq!(dumped[0x5555], 0xAA);
    assert_eq!(dumped[0x2AAA], 0x55);
    assert_eq!(dumped, image);

    let (bus, _) = finish(programmer, bridge);
    assert!(!bus.is_protected());
}

#[test]
fn page_units_land_at_their_addresses() {
    let mut image = vec![0u8; 1024];
    for (n, unit) in image
        .chunks_mut(256)
        .enumerate()
    {
        for (k, byte) in unit
            .iter_mut()
            .enumerate()
        {
            *byte = (n as u8).wrapping_mul(0x40) ^ k as u8;
        }
    }
    let (mut programmer, bridge) = start(SimulatedEeprom::default());
    programmer
        .write_image(&image, |_, _| {})
        .unwrap();
    let (bus, _) = finish(programmer, bridge);

    for n in 0..4 {
        for k in [0usize, 1, 63, 64, 128, 255] {
            assert_eq!(bus.contents()[n * 256 + k], image[n * 256 + k]);
        }
    }
    assert_eq!(bus.contents()[1024], 0xFF);
    assert_eq!(
        bus.page_programs(),
        &[
            0x000, 0x040, 0x080, 0x0C0, 0x100, 0x140, 0x180, 0x1C0, 0x200, 0x240, 0x280, 0x2C0,
            0x300, 0x340, 0x380, 0x3C0
        ]
    );
}

#[test]
fn write_progress_reports_every_unit() {
    let (mut programmer, bridge) = start(SimulatedEeprom::default());
    let mut seen = Vec::new();
    programmer
        .write_image(&pattern(1024), |done, total| seen.push((done, total)))
        .unwrap();
    finish(programmer, bridge);
    assert_eq!(seen, vec![(256, 1024), (512, 1024), (768, 1024), (1024, 1024)]);
}

#[test]
fn device_errors_are_located_and_do_not_stop_the_write() {
    let bus = SimulatedEeprom::default()
        .with_stuck_byte(0x0105, 0x00)
        .with_stuck_byte(0x01FF, 0x00);
    let image = vec![0xA5u8; 512];
    let (mut programmer, bridge) = start(bus);
    let report = programmer
        .write_image(&image, |_, _| {})
        .unwrap();

    let addresses: Vec<usize> = report
        .device_errors
        .iter()
        .map(|e| e.address())
        .collect();
    assert_eq!(addresses, vec![0x0105, 0x01FF]);
    for e in &report.device_errors {
        assert_eq!(e.record.expected, 0xA5);
        assert_eq!(e.record.actual, 0x00);
    }
    assert!(report.unacknowledged.is_empty());
    assert_eq!(programmer.state(), SessionState::Complete);

    let (bus, _) = finish(programmer, bridge);
    assert_eq!(
        bus.page_programs()
            .len(),
        8
    );
}

#[test]
fn dump_keeps_partial_data_when_bridge_goes_quiet() {
    let image = pattern(0x8000);
    let (host, bridge_end) = PipePort::pair();
    let bus = SimulatedEeprom::with_contents(0x8000, &image);
    // Signature (5) and size echo (5) pass, then 5000 stream bytes
    let link = Muted {
        link: bridge_end,
        budget: 10 + 5000,
    };
    let bridge = thread::spawn(move || serve(link, bus));

    let config = config().with_timeout(Duration::from_millis(200));
    let mut programmer = Programmer::with_config(host, config);
    let err = programmer
        .dump(20000, |_, _| {})
        .unwrap_err();

    assert!(err.is_timeout());
    let partial = err
        .partial_data()
        .unwrap();
    assert_eq!(partial.len(), 5000);
    assert_eq!(partial, &image[..5000]);
    assert_eq!(programmer.aborted_in(), Some(SessionState::Transfer));

    drop(programmer);
    bridge
        .join()
        .unwrap();
}

#[test]
fn verify_reports_the_differing_byte() {
    let reference = pattern(1024);
    let mut stored = reference.clone();
    stored[513] ^= 0xFF;

    let (mut programmer, bridge) = start(SimulatedEeprom::with_contents(0x8000, &stored));
    let report = programmer
        .verify(&reference, |_, _| {})
        .unwrap();
    assert!(!report.is_ok());
    assert_eq!(
        report.mismatches,
        vec![Mismatch {
            address: 0x0201,
            expected: reference[513],
            actual: stored[513],
        }]
    );
    finish(programmer, bridge);

    let (mut programmer, bridge) = start(SimulatedEeprom::with_contents(0x8000, &reference));
    let report = programmer
        .verify(&reference, |_, _| {})
        .unwrap();
    assert!(report.is_ok());
    assert_eq!(report.size, 1024);
    finish(programmer, bridge);
}

#[test]
fn protection_blocks_writes_until_disabled() {
    let (mut programmer, bridge) = start(SimulatedEeprom::default());
    programmer
        .enable_protection()
        .unwrap();

    let report = programmer
        .write_image(&[0x00; 256], |_, _| {})
        .unwrap();
    assert_eq!(report.device_errors.len(), 256);
    assert!(
        report
            .device_errors
            .iter()
            .all(|e| e.record.actual == 0xFF)
    );

    programmer
        .disable_protection()
        .unwrap();
    let report = programmer
        .write_image(&[0x00; 256], |_, _| {})
        .unwrap();
    assert!(report.is_clean());

    let (bus, served) = finish(programmer, bridge);
    assert!(!bus.is_protected());
    let commands: Vec<Command> = served
        .iter()
        .map(|d| d.command)
        .collect();
    assert_eq!(
        commands,
        vec![
            Command::Signature,
            Command::ProtectEnable,
            Command::Signature,
            Command::Write,
            Command::Signature,
            Command::ProtectDisable,
            Command::Signature,
            Command::Write,
        ]
    );
}

#[test]
fn listing_covers_the_whole_part() {
    let mut image = vec![0u8; 32];
    image[0x10] = 0xDE;
    image[0x1F] = 0xAD;
    let (mut programmer, bridge) = start(SimulatedEeprom::with_contents(0x8000, &image));
    let listing = programmer
        .read_listing()
        .unwrap();
    finish(programmer, bridge);

    let lines: Vec<&str> = listing
        .split("\r\n")
        .collect();
    assert_eq!(lines[0], "");
    assert_eq!(
        lines[2],
        "0010: DE 00 00 00 00 00 00 00   00 00 00 00 00 00 00 AD"
    );
    assert_eq!(
        lines[3],
        "0020: FF FF FF FF FF FF FF FF   FF FF FF FF FF FF FF FF"
    );
    assert!(lines[2048].starts_with("7FF0: "));
    assert_eq!(lines.len(), 2050);
}

#[test]
fn abandoned_bridge_session_recovers() {
    let (host, bridge_end) = PipePort::pair();
    let bridge = thread::spawn(move || serve(bridge_end, SimulatedEeprom::default()));

    // A raw host that refuses the size echo
    let mut raw = host;
    eeflash::Port::set_timeout(&mut raw, Duration::from_secs(2)).unwrap();
    eeflash::Port::write_all_bytes(&mut raw, b"W\x00\x01\x00\x00").unwrap();
    let mut echo = [0u8; 5];
    std::io::Read::read_exact(&mut raw, &mut echo).unwrap();
    assert_eq!(echo, [b'A', 0x00, 0x01, 0x00, 0x00]);
    eeflash::Port::write_all_bytes(&mut raw, b"N").unwrap();

    // The bridge is back at idle and serves the next session
    let mut programmer = Programmer::with_config(raw, config());
    programmer
        .signature()
        .unwrap();

    let (_, served) = finish(programmer, bridge);
    assert_eq!(
        served[0].outcome,
        Outcome::Abandoned {
            stage: Stage::SizeAck,
            received: b'N'
        }
    );
    assert_eq!(served[1].outcome, Outcome::Signed);
}

#[test]
fn silent_bridge_times_out_within_bound() {
    let (host, _bridge_end) = PipePort::pair();
    let config = config().with_timeout(Duration::from_millis(100));
    let mut programmer = Programmer::with_config(host, config);

    let start = Instant::now();
    let err = programmer
        .signature()
        .unwrap_err();
    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn cancel_token_stops_a_long_wait() {
    let (host, _bridge_end) = PipePort::pair();
    let token = CancelToken::new();
    let mut programmer = Programmer::with_config(host, config().with_timeout(Duration::from_secs(30)))
        .with_cancel_token(token.clone());

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        token.cancel();
    });

    let start = Instant::now();
    assert!(matches!(programmer.signature(), Err(Error::Interrupted)));
    assert!(start.elapsed() < Duration::from_secs(5));
    canceller
        .join()
        .unwrap();
}
