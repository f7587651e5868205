use std::sync::{Arc, Mutex};

use dotmatrix_core::{
    interfaces::{LoopbackLink, SerialLink},
    mmu::Mmu,
};

const SERIAL_BIT: u8 = 0x08;

#[derive(Clone, Default)]
struct Recorder {
    sent: Arc<Mutex<Vec<u8>>>,
    reply: u8,
}

impl SerialLink for Recorder {
    fn send_data(&mut self, byte: u8) {
        self.sent.lock().unwrap().push(byte);
    }

    fn receive_data(&mut self) -> u8 {
        self.reply
    }
}

fn start_transfer(mmu: &mut Mmu, byte: u8, sc: u8) {
    mmu.if_reg = 0;
    mmu.write_byte(0xFF01, byte);
    mmu.write_byte(0xFF02, sc);
}

#[test]
fn internal_clock_transfer_completes_after_eight_bits() {
    let mut mmu = Mmu::new(false, 44_100);
    let recorder = Recorder {
        reply: 0xA5,
        ..Recorder::default()
    };
    mmu.serial.connect(Box::new(recorder.clone()));
    start_transfer(&mut mmu, 0x42, 0x81);
    assert_eq!(mmu.read_byte(0xFF02), 0xFF);

    // 8192 Hz: one bit per 128 machine cycles.
    mmu.tick(7 * 128);
    assert!(mmu.serial.transfer_active());
    assert_eq!(mmu.if_reg & SERIAL_BIT, 0);
    mmu.tick(2 * 128);
    assert!(!mmu.serial.transfer_active());
    assert_eq!(mmu.if_reg & SERIAL_BIT, SERIAL_BIT);
    assert_eq!(mmu.read_byte(0xFF02), 0x7E | 0x01);
    assert_eq!(mmu.read_byte(0xFF01), 0xA5);
    assert_eq!(*recorder.sent.lock().unwrap(), vec![0x42]);
}

#[test]
fn unconnected_port_shifts_in_ones() {
    let mut mmu = Mmu::new(false, 44_100);
    start_transfer(&mut mmu, 0x00, 0x81);
    mmu.tick(9 * 128);
    assert_eq!(mmu.read_byte(0xFF01), 0xFF);
}

#[test]
fn cgb_fast_clock() {
    let mut mmu = Mmu::new(true, 44_100);
    start_transfer(&mut mmu, 0x10, 0x83);
    assert_eq!(mmu.read_byte(0xFF02), 0xFF);
    // 262144 Hz: one bit per 4 machine cycles.
    mmu.tick(9 * 4);
    assert_eq!(mmu.if_reg & SERIAL_BIT, SERIAL_BIT);
    assert_eq!(mmu.read_byte(0xFF02), 0x7F);
}

#[test]
fn loopback_echoes_previous_byte() {
    let mut mmu = Mmu::new(false, 44_100);
    mmu.serial.connect(Box::new(LoopbackLink::default()));
    start_transfer(&mut mmu, 0x31, 0x81);
    mmu.tick(9 * 128);
    assert_eq!(mmu.read_byte(0xFF01), 0xFF);
    start_transfer(&mut mmu, 0x32, 0x81);
    mmu.tick(9 * 128);
    assert_eq!(mmu.read_byte(0xFF01), 0x31);
}

#[test]
fn external_clock_waits_for_partner() {
    let mut mmu = Mmu::new(false, 44_100);
    start_transfer(&mut mmu, 0x55, 0x80);
    mmu.tick(10_000);
    assert!(mmu.serial.transfer_active());
    assert_eq!(mmu.read_byte(0xFF02), 0xFE);
    assert_eq!(mmu.if_reg & SERIAL_BIT, 0);
}
