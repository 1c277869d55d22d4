//! SerialSink: raw COM1 byte output, the only legal side channel during
//! bring-up. Every other component in this core logs diagnostics through
//! the `log` facade, which in turn writes through this sink — it must
//! never itself fail or recurse.

use conquer_once::spin::OnceCell;
use core::fmt;
use spin::Mutex;
use uart_16550::SerialPort;

/// Default 16550 I/O base (COM1). Overridden at init by `BootHandoff::serial_base()`.
pub const DEFAULT_PORT_BASE: u16 = 0x3F8;

/// A single 16550-compatible UART programmed for output, driven through
/// `uart_16550::SerialPort` — the same crate the teacher uses for its own
/// serial port, rather than hand-rolled register programming.
pub struct SerialSink {
    port: SerialPort,
}

impl SerialSink {
    /// Program the UART at `base` for output. `SerialPort::init` sets the
    /// baud-rate divisor, 8N1 framing, FIFO, and DTR/RTS/OUT2 the same way
    /// the raw register sequence did.
    pub fn init(base: u16) -> Self {
        let mut port = unsafe { SerialPort::new(base) };
        port.init();
        SerialSink { port }
    }

    /// Write a single byte. Never fails: the sink is the error channel.
    pub fn write_byte(&mut self, byte: u8) {
        self.port.send(byte);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }

    pub fn newline(&mut self) {
        self.write_byte(b'\r');
        self.write_byte(b'\n');
    }

    fn write_hex_digits(&mut self, value: u64, digits: usize) {
        self.write_bytes(b"0x");
        for i in (0..digits).rev() {
            let nibble = ((value >> (i * 4)) & 0xF) as u8;
            let c = if nibble < 10 { b'0' + nibble } else { b'a' + nibble - 10 };
            self.write_byte(c);
        }
    }

    pub fn write_hex_u16(&mut self, value: u16) {
        self.write_hex_digits(value as u64, 4);
    }

    pub fn write_hex_u32(&mut self, value: u32) {
        self.write_hex_digits(value as u64, 8);
    }

    pub fn write_hex_u64(&mut self, value: u64) {
        self.write_hex_digits(value, 16);
    }

    pub fn write_dec_u64(&mut self, mut value: u64) {
        if value == 0 {
            self.write_byte(b'0');
            return;
        }
        let mut digits = [0u8; 20];
        let mut n = 0;
        while value > 0 {
            digits[n] = b'0' + (value % 10) as u8;
            value /= 10;
            n += 1;
        }
        for i in (0..n).rev() {
            self.write_byte(digits[i]);
        }
    }

    pub fn write_dec_u32(&mut self, value: u32) {
        self.write_dec_u64(value as u64);
    }

    pub fn write_dec_i32(&mut self, value: i32) {
        if value < 0 {
            self.write_byte(b'-');
            self.write_dec_u64((-(value as i64)) as u64);
        } else {
            self.write_dec_u64(value as u64);
        }
    }
}

impl fmt::Write for SerialSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_bytes(s.as_bytes());
        Ok(())
    }
}

static SERIAL: OnceCell<Mutex<SerialSink>> = OnceCell::uninit();

/// Initialize the global serial sink. Must be called exactly once, before
/// any other component logs.
pub fn init(base: u16) {
    SERIAL.init_once(|| Mutex::new(SerialSink::init(base)));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    if let Some(sink) = SERIAL.get() {
        let _ = sink.lock().write_fmt(args);
    }
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => ($crate::serial::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}

/// `log::Log` adapter writing every record through the serial sink.
pub struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            serial_println!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install `SerialLogger` as the global `log` backend. Call after `init()`.
pub fn init_logger() {
    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(log::LevelFilter::Trace))
        .expect("logger already initialized");
}
