//! COM1 console.
//!
//! The UART model is [`vm_superio::Serial`]; this wraps it as a
//! [`BusDevice`] on ports `0x3f8..0x400`, sends its interrupt through an
//! [`IrqSender`] on IRQ 4, and optionally pumps host stdin into the
//! receive FIFO from a helper thread.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};
use vm_superio::serial::NoEvents;
use vm_superio::Serial;

use super::BusDevice;
use crate::interrupt::IrqSender;

/// Base I/O port for COM1.
pub const COM1_BASE: u16 = 0x3F8;

/// Number of UART registers.
pub const COM1_LEN: u16 = 8;

/// IRQ line for COM1.
pub const SERIAL_IRQ: u32 = 4;

const FIFO_RETRY: Duration = Duration::from_millis(5);

type Uart = Serial<IrqSender, NoEvents, Box<dyn Write + Send>>;

pub struct SerialConsole {
    uart: Uart,
}

impl SerialConsole {
    /// A console writing guest output to `out`.
    pub fn new(irq: IrqSender, out: Box<dyn Write + Send>) -> Self {
        Self {
            uart: Serial::new(irq, out),
        }
    }

    /// Push host input into the receive FIFO.
    ///
    /// Returns how many bytes fit; the rest must be retried.
    pub fn enqueue_input(&mut self, bytes: &[u8]) -> usize {
        let room = self.uart.fifo_capacity().min(bytes.len());
        if room == 0 {
            return 0;
        }
        match self.uart.enqueue_raw_bytes(&bytes[..room]) {
            Ok(n) => n,
            Err(e) => {
                warn!("serial input dropped: {e:?}");
                room
            }
        }
    }
}

impl BusDevice for SerialConsole {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        if let Some(first) = data.first_mut() {
            *first = self.uart.read(offset as u8);
        }
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        if let Some(&value) = data.first() {
            if let Err(e) = self.uart.write(offset as u8, value) {
                debug!("serial write at offset {offset} failed: {e:?}");
            }
        }
    }
}

/// Forward host stdin to the console until stdin closes.
pub fn spawn_stdin_pump(console: Arc<Mutex<SerialConsole>>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("serial-stdin".into())
        .spawn(move || pump(io::stdin().lock(), &console))
}

fn pump<R: Read>(mut input: R, console: &Mutex<SerialConsole>) {
    let mut buf = [0u8; 64];
    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("stdin read failed, serial input stopped: {e}");
                return;
            }
        };
        let mut pending = &buf[..n];
        while !pending.is_empty() {
            let taken = console
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .enqueue_input(pending);
            pending = &pending[taken..];
            if taken == 0 {
                thread::sleep(FIFO_RETRY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupt::InterruptSignal;

    const DATA: u64 = 0;
    const IER: u64 = 1;
    const LSR: u64 = 5;
    const IER_RDA: u8 = 0x01;
    const LSR_DATA_READY: u8 = 0x01;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn console() -> (SerialConsole, Arc<InterruptSignal>, Captured) {
        let signal = Arc::new(InterruptSignal::new());
        let out = Captured::default();
        let irq = IrqSender::new(signal.clone(), SERIAL_IRQ).unwrap();
        (SerialConsole::new(irq, Box::new(out.clone())), signal, out)
    }

    #[test]
    fn port_range_is_com1() {
        assert_eq!(COM1_BASE + COM1_LEN - 1, 0x3ff);
    }

    #[test]
    fn guest_output_reaches_host() {
        let (mut dev, _, out) = console();
        for &b in b"ok\n" {
            dev.write(DATA, &[b]);
        }
        assert_eq!(out.0.lock().unwrap().as_slice(), b"ok\n");
    }

    #[test]
    fn host_input_is_readable_and_raises_irq() {
        let (mut dev, signal, _) = console();
        dev.write(IER, &[IER_RDA]);
        let _ = signal.take();

        assert_eq!(dev.enqueue_input(b"x"), 1);
        assert_eq!(signal.take(), 1 << SERIAL_IRQ);

        let mut lsr = [0u8];
        dev.read(LSR, &mut lsr);
        assert_ne!(lsr[0] & LSR_DATA_READY, 0);
        let mut data = [0u8];
        dev.read(DATA, &mut data);
        assert_eq!(data[0], b'x');
    }

    #[test]
    fn pump_feeds_all_input() {
        let (dev, _, _) = console();
        let dev = Mutex::new(dev);
        pump(&b"hello"[..], &dev);

        let mut dev = dev.into_inner().unwrap();
        let mut got = Vec::new();
        for _ in 0..5 {
            let mut b = [0u8];
            dev.read(DATA, &mut b);
            got.push(b[0]);
        }
        assert_eq!(got, b"hello");
    }
}
