//! Drives the whole stack — SWD framing, DP/AP plumbing, NVMC sequencing,
//! the hex parser, and the update coordinator — against a software model
//! of a Cortex-M + NVMC target wired up as a [`PinDriver`]. The model
//! speaks the same wire framing [`swd_flasher::swd`] implements, so a
//! passing test here exercises real encode/decode on both sides, not just
//! one layer in isolation.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use swd_flasher::progress::NullProgress;
use swd_flasher::swd::PinDriver;
use swd_flasher::Session;

const NVMC_READY: u32 = 0x4001_E400;
const NVMC_CONFIG: u32 = 0x4001_E504;
const NVMC_ERASEPAGE: u32 = 0x4001_E508;
const NVMC_ERASEALL: u32 = 0x4001_E50C;
const NVMC_ICACHECNF: u32 = 0x4001_E540;
const DHCSR: u32 = 0xE000_EDF0;
const DEMCR: u32 = 0xE000_EDFC;
const VTOR: u32 = 0xE000_ED08;
const AIRCR: u32 = 0xE000_ED0C;
const PAGE_SIZE: u32 = 4096;

/// The simulated chip: DP registers, one MEM-AP, one CTRL-AP, and a
/// sparse flash image that reads as erased (`0xFFFF_FFFF`) until written.
struct Device {
    idcode: u32,
    select: u32,
    ctrl_stat: u32,
    ap_read_latched: u32,
    ap0_csw: u32,
    ap0_tar: u32,
    ctrl_ap_reset: u32,
    ctrl_ap_eraseall: u32,
    nvmc_config: u32,
    dhcsr: u32,
    demcr: u32,
    vtor: u32,
    icachecnf: u32,
    flash: HashMap<u32, u32>,
}

impl Device {
    fn new() -> Self {
        Device {
            idcode: 0x2BA0_1477,
            select: u32::MAX,
            ctrl_stat: 0,
            ap_read_latched: 0,
            ap0_csw: 0,
            ap0_tar: 0,
            ctrl_ap_reset: 0,
            ctrl_ap_eraseall: 0,
            nvmc_config: 0,
            dhcsr: 0,
            demcr: 0,
            vtor: 0,
            icachecnf: 0,
            flash: HashMap::new(),
        }
    }
}

fn mem_read(dev: &Device, addr: u32) -> u32 {
    match addr {
        NVMC_READY => 1,
        NVMC_CONFIG => dev.nvmc_config,
        NVMC_ICACHECNF => dev.icachecnf,
        DHCSR => dev.dhcsr,
        DEMCR => dev.demcr,
        VTOR => dev.vtor,
        _ => *dev.flash.get(&addr).unwrap_or(&0xFFFF_FFFF),
    }
}

fn mem_write(dev: &mut Device, addr: u32, value: u32) {
    match addr {
        NVMC_CONFIG => dev.nvmc_config = value,
        NVMC_ERASEPAGE => {
            if dev.nvmc_config == 2 {
                let page_base = value - (value % PAGE_SIZE);
                for off in (0..PAGE_SIZE).step_by(4) {
                    dev.flash.insert(page_base + off, 0xFFFF_FFFF);
                }
            }
        }
        NVMC_ERASEALL => {
            if dev.nvmc_config == 2 && value == 1 {
                dev.flash.clear();
            }
        }
        NVMC_ICACHECNF => dev.icachecnf = value,
        DHCSR => dev.dhcsr = value,
        DEMCR => dev.demcr = value,
        VTOR => dev.vtor = value,
        AIRCR => {}
        _ => {
            if dev.nvmc_config != 0 || addr >= 0x2000_0000 {
                dev.flash.insert(addr, value);
            }
        }
    }
}

fn auto_increment(dev: &mut Device) {
    if (dev.ap0_csw >> 4) & 0b11 == 0b01 {
        let tar = dev.ap0_tar;
        let next = tar.wrapping_add(4);
        dev.ap0_tar = if (tar & !0x3FF) != (next & !0x3FF) {
            (tar & !0x3FF) | (next & 0x3FF)
        } else {
            next
        };
    }
}

fn ap_reg_read(dev: &mut Device, ap_number: u8, bank: u8, addr: u8) -> u32 {
    match (ap_number, bank, addr) {
        (0, 0, 0x0) => dev.ap0_csw,
        (0, 0, 0x4) => dev.ap0_tar,
        (0, 0, 0xC) => {
            let value = mem_read(dev, dev.ap0_tar);
            auto_increment(dev);
            value
        }
        (1, 0, 0x0) => dev.ctrl_ap_reset,
        (1, 0, 0x4) => dev.ctrl_ap_eraseall,
        (1, 0, 0x8) => 0,
        (1, 0, 0xC) => 0,
        (1, 0xF, 0xC) => 0x0288_0000,
        _ => 0,
    }
}

fn ap_reg_write(dev: &mut Device, ap_number: u8, bank: u8, addr: u8, value: u32) {
    match (ap_number, bank, addr) {
        (0, 0, 0x0) => dev.ap0_csw = value,
        (0, 0, 0x4) => dev.ap0_tar = value,
        (0, 0, 0xC) => {
            mem_write(dev, dev.ap0_tar, value);
            auto_increment(dev);
        }
        (1, 0, 0x0) => dev.ctrl_ap_reset = value,
        (1, 0, 0x4) => {
            dev.ctrl_ap_eraseall = value;
            if value == 1 {
                dev.flash.clear();
            }
        }
        _ => {}
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AckCode {
    Ok,
}

enum Mode {
    Idle,
    Request { bits: u8, count: u8 },
    TargetDrives { queue: VecDeque<bool> },
    WriteData { bits: u64, count: u8 },
    Park,
}

fn decode_request_byte(b: u8) -> (bool, bool, u8) {
    let apndp = (b >> 1) & 1 != 0;
    let rnw = (b >> 2) & 1 != 0;
    let a2 = (b >> 3) & 1 != 0;
    let a3 = (b >> 4) & 1 != 0;
    let addr = ((a3 as u8) << 3) | ((a2 as u8) << 2);
    (apndp, rnw, addr)
}

fn push_ack_bits(queue: &mut VecDeque<bool>) {
    // AckCode::Ok == 0b001, LSB first.
    queue.push_back(true);
    queue.push_back(false);
    queue.push_back(false);
}

fn push_data_bits(queue: &mut VecDeque<bool>, value: u32) {
    for i in 0..32 {
        queue.push_back((value >> i) & 1 != 0);
    }
    queue.push_back(value.count_ones() % 2 == 1);
}

/// Software model of the wire-protocol responder: decodes the request
/// byte the driver drives, then drives ACK (+ data, for a successful
/// read) back, mirroring exactly the bit sequence `swd_flasher::swd`
/// produces. Every WAIT/FAULT path is out of scope here; this model
/// always answers `OK`.
struct MockPins {
    device: Rc<RefCell<Device>>,
    mode: Mode,
    decoded: Option<(bool, bool, u8)>,
    current_ack: AckCode,
    current_target: (bool, bool, u8),
    pending_write_expected: bool,
}

impl MockPins {
    fn new(device: Rc<RefCell<Device>>) -> Self {
        MockPins {
            device,
            mode: Mode::Idle,
            decoded: None,
            current_ack: AckCode::Ok,
            current_target: (false, true, 0),
            pending_write_expected: false,
        }
    }

    fn perform_ap_raw_read(&mut self, addr: u8) -> u32 {
        let mut dev = self.device.borrow_mut();
        let ap_number = (dev.select >> 24) as u8;
        let bank = ((dev.select >> 4) & 0xF) as u8;
        let fresh = ap_reg_read(&mut dev, ap_number, bank, addr);
        let stale = dev.ap_read_latched;
        dev.ap_read_latched = fresh;
        stale
    }

    fn perform_ap_write(&mut self, addr: u8, value: u32) {
        let mut dev = self.device.borrow_mut();
        let ap_number = (dev.select >> 24) as u8;
        let bank = ((dev.select >> 4) & 0xF) as u8;
        ap_reg_write(&mut dev, ap_number, bank, addr, value);
    }

    fn perform_dp_read(&mut self, addr: u8) -> u32 {
        let dev = self.device.borrow();
        match addr {
            0x0 => dev.idcode,
            0x4 => dev.ctrl_stat,
            0xC => dev.ap_read_latched,
            _ => 0,
        }
    }

    fn perform_dp_write(&mut self, addr: u8, value: u32) {
        let mut dev = self.device.borrow_mut();
        match addr {
            0x4 => {
                dev.ctrl_stat = value;
                let ack = ((value & (1 << 30) != 0) as u32) << 31 | ((value & (1 << 28) != 0) as u32) << 29;
                let keep_mask = !((1u32 << 31) | (1u32 << 29));
                dev.ctrl_stat = (dev.ctrl_stat & keep_mask) | ack;
            }
            0x8 => dev.select = value,
            _ => {}
        }
    }
}

impl PinDriver for MockPins {
    fn set_swclk(&mut self, _high: bool) {}

    fn set_swdio(&mut self, high: bool) {
        let mut complete_write = None;
        match &mut self.mode {
            Mode::Request { bits, count } => {
                if *count < 8 {
                    if high {
                        *bits |= 1 << *count;
                    }
                    *count += 1;
                    if *count == 8 {
                        self.decoded = Some(decode_request_byte(*bits));
                    }
                }
            }
            Mode::WriteData { bits, count } => {
                if *count < 33 {
                    if high {
                        *bits |= 1u64 << *count;
                    }
                    *count += 1;
                    if *count == 33 {
                        complete_write = Some((*bits & 0xFFFF_FFFF) as u32);
                    }
                }
            }
            Mode::Park => {
                self.mode = Mode::Idle;
            }
            _ => {}
        }
        if let Some(value) = complete_write {
            let (apndp, _, addr) = self.current_target;
            if apndp {
                self.perform_ap_write(addr, value);
            } else {
                self.perform_dp_write(addr, value);
            }
            self.mode = Mode::Park;
        }
    }

    fn set_swdio_input(&mut self) {
        let (apndp, rnw, addr) = self.decoded.take().unwrap_or((false, true, 0));
        let ack = AckCode::Ok;
        let is_read_ok = rnw;
        self.current_ack = ack;
        self.current_target = (apndp, rnw, addr);
        self.pending_write_expected = !is_read_ok;

        let mut queue = VecDeque::new();
        push_ack_bits(&mut queue);
        if is_read_ok {
            let value = if apndp {
                self.perform_ap_raw_read(addr)
            } else {
                self.perform_dp_read(addr)
            };
            push_data_bits(&mut queue, value);
        }
        self.mode = Mode::TargetDrives { queue };
    }

    fn set_swdio_output(&mut self) {
        let was_target_drives = matches!(self.mode, Mode::TargetDrives { .. });
        self.mode = if was_target_drives {
            if self.pending_write_expected {
                Mode::WriteData { bits: 0, count: 0 }
            } else {
                Mode::Park
            }
        } else {
            Mode::Request { bits: 0, count: 0 }
        };
    }

    fn read_swdio(&mut self) -> bool {
        match &mut self.mode {
            Mode::TargetDrives { queue } => queue.pop_front().unwrap_or(false),
            _ => false,
        }
    }

    fn delay_ns(&mut self, _nanos: u32) {}
    fn delay_ms(&mut self, _millis: u32) {}
}

#[test_log::test]
fn mass_erase_unprotect_is_idempotent_and_clears_flash() {
    let device = Rc::new(RefCell::new(Device::new()));
    device.borrow_mut().flash.insert(0x1000, 0x1234_5678);

    let mut session = Session::new(MockPins::new(device.clone()), 0);
    session.mass_erase_unprotect().expect("first mass erase");
    assert!(device.borrow().flash.is_empty());

    session.mass_erase_unprotect().expect("second mass erase");
    assert!(device.borrow().flash.is_empty());
}

#[test_log::test]
fn flashing_a_minimal_image_writes_the_expected_words() {
    let device = Rc::new(RefCell::new(Device::new()));
    let mut session = Session::new(MockPins::new(device.clone()), 0);

    let image = b":10010000214601360121470136007EFE09D2190140\n:00000001FF\n";
    let mut update = session.begin_update().expect("begin_update");
    update.set_mass_erased(false);
    let mut progress = NullProgress;
    update.ingest(image, &mut progress).expect("ingest");
    assert!(update.is_finished());

    let dev = device.borrow();
    assert_eq!(dev.flash.get(&0x0000_0100), Some(&0x3601_4621));
    assert_eq!(dev.flash.get(&0x0000_0104), Some(&0x0147_2101));
    // Reset-and-release ran at EOF: debug stays enabled-but-unhalted is not
    // guaranteed, but DEMCR and the read-only CONFIG invariant must hold.
    assert_eq!(dev.nvmc_config, 0);
    assert_eq!(dev.demcr, 0);
}

#[test_log::test]
fn flash_driver_always_leaves_config_read_only() {
    let device = Rc::new(RefCell::new(Device::new()));
    let mut session = Session::new(MockPins::new(device.clone()), 0);
    session.mass_erase().expect("mass erase via NVMC");
    assert_eq!(device.borrow().nvmc_config, 0);
}
