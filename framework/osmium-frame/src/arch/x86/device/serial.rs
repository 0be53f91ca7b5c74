//! A port-mapped 16550 UART, output only. The kernel console renders
//! elsewhere; this line exists for the logger.

use x86_64::instructions::port::Port;

bitflags::bitflags! {
    struct LineSts: u8 {
        const INPUT_FULL = 1;
        const OUTPUT_EMPTY = 1 << 5;
    }
}

const SERIAL_DATA_PORT: u16 = 0x3F8;

/// Initializes the serial port: 38400 bps, 8 data bits, FIFO on, no IRQs.
pub(crate) fn init() {
    // Safety: well-known COM1 register block, only touched here and in
    // `send` below.
    unsafe {
        Port::<u8>::new(SERIAL_DATA_PORT + 1).write(0x00u8);
        Port::<u8>::new(SERIAL_DATA_PORT + 3).write(0x80u8);
        Port::<u8>::new(SERIAL_DATA_PORT).write(0x03u8);
        Port::<u8>::new(SERIAL_DATA_PORT + 1).write(0x00u8);
        Port::<u8>::new(SERIAL_DATA_PORT + 3).write(0x03u8);
        Port::<u8>::new(SERIAL_DATA_PORT + 2).write(0xC7u8);
        Port::<u8>::new(SERIAL_DATA_PORT + 4).write(0x0Bu8);
    }
}

fn line_sts() -> LineSts {
    // Safety: reading the line status register has no side effects.
    let sts = unsafe { Port::<u8>::new(SERIAL_DATA_PORT + 5).read() };
    LineSts::from_bits_truncate(sts)
}

/// Sends a byte, spinning until the transmit holding register is empty.
pub fn send(data: u8) {
    while !line_sts().contains(LineSts::OUTPUT_EMPTY) {
        core::hint::spin_loop();
    }
    // Safety: see `init`.
    unsafe { Port::<u8>::new(SERIAL_DATA_PORT).write(data) };
}
