//! Low-level serial port I/O.
//!
//! The single funnel for putting bytes on a UART.  The early-boot klog
//! fallback and any later console backend both route through here so that
//! output behaves identically (`\n` → `\r\n`, LSR polling) regardless of
//! which stage of boot emitted it.
//!
//! The functions are intentionally lock-free: callers are responsible for
//! serialisation (cli, spinlock, IrqMutex, ... whatever suits the context).

use x86_64::instructions::port::Port;

pub const COM1_BASE: u16 = 0x3F8;

/// Transmit holding register (offset from UART base).
const UART_REG_THR: u16 = 0;
/// Line status register.
const UART_REG_LSR: u16 = 5;
/// LSR bit: transmit holding register empty.
const UART_LSR_TX_EMPTY: u8 = 0x20;

/// Write one byte to a UART, polling the Line Status Register until the
/// transmit holding register is empty.
///
/// # Safety
///
/// Port I/O.  Caller must ensure `base` refers to a valid UART whose
/// transmitter is operational, and must serialise concurrent writers.
pub unsafe fn serial_write_byte(base: u16, byte: u8) {
    let mut lsr: Port<u8> = Port::new(base + UART_REG_LSR);
    let mut thr: Port<u8> = Port::new(base + UART_REG_THR);
    while lsr.read() & UART_LSR_TX_EMPTY == 0 {
        core::hint::spin_loop();
    }
    thr.write(byte);
}

/// Write a byte slice to a UART, converting `\n` to `\r\n`.
///
/// # Safety
///
/// Same contract as [`serial_write_byte`].
pub unsafe fn serial_write_bytes(base: u16, bytes: &[u8]) {
    for &b in bytes {
        if b == b'\n' {
            serial_write_byte(base, b'\r');
        }
        serial_write_byte(base, b);
    }
}
