//! Parallel EEPROM bus access.
//!
//! [`EepromBus`] is the boundary to the electrical side: address latching,
//! data-direction switching and byte/page programming. The direction latch
//! lives inside each driver instance.
//!
//! [`SimulatedEeprom`] models a 28C256-style part in memory, including the
//! JEDEC software data protection sequences, and can be told to misreport
//! individual cells to exercise the verification path.

use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use crate::protocol::{EEPROM_CAPACITY, PHYSICAL_PAGE_SIZE};

/// Software data protection enable sequence (address, data).
pub const SDP_ENABLE: [(u16, u8); 3] = [(0x5555, 0xAA), (0x2AAA, 0x55), (0x5555, 0xA0)];

/// Software data protection disable sequence (address, data).
pub const SDP_DISABLE: [(u16, u8); 6] = [
    (0x5555, 0xAA),
    (0x2AAA, 0x55),
    (0x5555, 0x80),
    (0x5555, 0xAA),
    (0x2AAA, 0x55),
    (0x5555, 0x20),
];

/// Direction of the data lines, seen from the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    /// Bridge reads the memory's outputs.
    Input,
    /// Bridge drives the data lines.
    Output,
}

/// Address-indexed access to the memory device.
pub trait EepromBus {
    /// Addressable bytes.
    fn capacity(&self) -> usize;

    /// Latch `address` onto the address lines.
    fn set_address(&mut self, address: u16);

    /// Switch the data lines. Drivers skip the switch when already set.
    fn set_data_direction(&mut self, direction: DataDirection);

    /// Read one byte.
    fn read_byte(&mut self, address: u16) -> u8;

    /// Write one byte. The data lines must already be outputs.
    fn write_byte(&mut self, address: u16, data: u8);

    /// Program one physical page starting at `address`.
    fn write_page(&mut self, address: u16, data: &[u8; PHYSICAL_PAGE_SIZE]) {
        self.set_data_direction(DataDirection::Output);
        for (offset, byte) in (0u16..).zip(data.iter()) {
            self.write_byte(address.wrapping_add(offset), *byte);
        }
    }

    /// Wait for an internal program cycle to finish.
    fn settle(&mut self, delay: Duration) {
        thread::sleep(delay);
    }
}

/// In-memory parallel EEPROM.
#[derive(Debug, Clone)]
pub struct SimulatedEeprom {
    cells: Vec<u8>,
    address: u16,
    direction: Option<DataDirection>,
    direction_switches: usize,
    protected: bool,
    pending_sequence: Vec<(u16, u8)>,
    stuck: HashMap<u16, u8>,
    page_programs: Vec<u16>,
    settles: usize,
    real_time: bool,
}

impl Default for SimulatedEeprom {
    fn default() -> Self {
        Self::new(EEPROM_CAPACITY)
    }
}

impl SimulatedEeprom {
    /// Blank (all `0xFF`) part of the given size.
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: vec![0xFF; capacity],
            address: 0,
            direction: None,
            direction_switches: 0,
            protected: false,
            pending_sequence: Vec::new(),
            stuck: HashMap::new(),
            page_programs: Vec::new(),
            settles: 0,
            real_time: false,
        }
    }

    /// Part preloaded with `image` at address 0; the rest stays blank.
    pub fn with_contents(capacity: usize, image: &[u8]) -> Self {
        let mut eeprom = Self::new(capacity);
        let len = image.len().min(capacity);
        eeprom.cells[..len].copy_from_slice(&image[..len]);
        eeprom
    }

    /// Make reads of `address` always return `value`.
    #[must_use]
    pub fn with_stuck_byte(mut self, address: u16, value: u8) -> Self {
        self.stuck
            .insert(address, value);
        self
    }

    /// Actually sleep in [`EepromBus::settle`] instead of only counting.
    #[must_use]
    pub fn with_real_time(mut self, real_time: bool) -> Self {
        self.real_time = real_time;
        self
    }

    /// Raw cell contents, ignoring stuck-byte faults.
    pub fn contents(&self) -> &[u8] {
        &self.cells
    }

    /// Whether software data protection is active.
    pub fn is_protected(&self) -> bool {
        self.protected
    }

    /// Start addresses of every physical page program, in order.
    pub fn page_programs(&self) -> &[u16] {
        &self.page_programs
    }

    /// Number of settle waits requested.
    pub fn settles(&self) -> usize {
        self.settles
    }

    /// Number of times the data lines actually changed direction.
    pub fn direction_switches(&self) -> usize {
        self.direction_switches
    }

    /// Feed a write through the protection sequence detector.
    ///
    /// Returns `true` when the write was consumed as a command byte.
    fn track_sequence(&mut self, address: u16, data: u8) -> bool {
        self.pending_sequence
            .push((address, data));
        let pending = self
            .pending_sequence
            .as_slice();

        if pending == SDP_ENABLE {
            debug!("Simulated EEPROM: software data protection enabled");
            self.protected = true;
            self.pending_sequence
                .clear();
            return true;
        }
        if pending == SDP_DISABLE {
            debug!("Simulated EEPROM: software data protection disabled");
            self.protected = false;
            self.pending_sequence
                .clear();
            return true;
        }
        if SDP_ENABLE.starts_with(pending) || SDP_DISABLE.starts_with(pending) {
            return true;
        }

        self.pending_sequence
            .clear();
        false
    }

    fn store(&mut self, address: u16, data: u8) {
        if self.protected {
            trace!("Simulated EEPROM: write to 0x{address:04X} blocked by protection");
            return;
        }
        if let Some(cell) = self
            .cells
            .get_mut(usize::from(address))
        {
            *cell = data;
        }
    }
}

impl EepromBus for SimulatedEeprom {
    fn capacity(&self) -> usize {
        self.cells
            .len()
    }

    fn set_address(&mut self, address: u16) {
        self.address = address;
    }

    fn set_data_direction(&mut self, direction: DataDirection) {
        if self.direction == Some(direction) {
            return;
        }
        self.direction = Some(direction);
        self.direction_switches += 1;
    }

    fn read_byte(&mut self, address: u16) -> u8 {
        self.set_address(address);
        self.set_data_direction(DataDirection::Input);
        if let Some(&value) = self
            .stuck
            .get(&address)
        {
            return value;
        }
        self.cells
            .get(usize::from(address))
            .copied()
            .unwrap_or(0xFF)
    }

    fn write_byte(&mut self, address: u16, data: u8) {
        self.set_address(address);
        if self.direction != Some(DataDirection::Output) {
            trace!("Simulated EEPROM: write to 0x{address:04X} ignored, bus not driven");
            return;
        }
        if self.track_sequence(address, data) {
            return;
        }
        self.store(address, data);
    }

    /// Page loads carry image data only and never reach the sequence detector.
    fn write_page(&mut self, address: u16, data: &[u8; PHYSICAL_PAGE_SIZE]) {
        self.page_programs
            .push(address);
        self.set_data_direction(DataDirection::Output);
        self.pending_sequence
            .clear();
        for (offset, byte) in (0u16..).zip(data.iter()) {
            let target = address.wrapping_add(offset);
            self.set_address(target);
            self.store(target, *byte);
        }
    }

    fn settle(&mut self, delay: Duration) {
        self.settles += 1;
        if self.real_time {
            thread::sleep(delay);
        }
    }
}
