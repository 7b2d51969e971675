/*
 * Console
 *
 * Output goes to the UART; input arrives from the keyboard interrupt,
 * lands in a fixed-capacity ring, and credits an await-event so readers
 * block without polling. This is the device contract the shell consumes.
 */

pub mod keyboard;

use core::fmt::{self, Write};

use heapless::Deque;
use lazy_static::lazy_static;

use crate::KResult;
use crate::arch::x86_64::uart;
use crate::sync::event::AwaitEvent;
use crate::sync::spinlock::SpinLock;

const INPUT_CAPACITY: usize = 256;

static INPUT: SpinLock<Deque<char, INPUT_CAPACITY>> = SpinLock::new(Deque::new());

lazy_static! {
    static ref INPUT_EVENT: AwaitEvent = AwaitEvent::new();
}

pub fn init() {
    uart::init();
}

/// Feed one decoded character from interrupt context. Overflow drops
/// the oldest character.
pub fn push_char(ch: char) {
    let mut input = INPUT.lock();
    if input.is_full() {
        let _ = input.pop_front();
    }
    let _ = input.push_back(ch);
    drop(input);
    INPUT_EVENT.wakeup();
}

/// Non-blocking read.
pub fn try_read_char() -> Option<char> {
    INPUT.lock().pop_front()
}

/// Blocking read; sleeps on the input event until a character arrives.
pub fn read_char() -> KResult<char> {
    loop {
        if let Some(ch) = try_read_char() {
            return Ok(ch);
        }
        INPUT_EVENT.await_event()?;
    }
}

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        uart::write_str(s);
        Ok(())
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    let _ = ConsoleWriter.write_fmt(args);
}

pub fn write_str(s: &str) {
    uart::write_str(s);
}

pub fn write_char(ch: char) {
    let mut buf = [0u8; 4];
    uart::write_str(ch.encode_utf8(&mut buf));
}

/// Rub out the last echoed character.
pub fn backspace() {
    uart::write_str("\x08 \x08");
}
