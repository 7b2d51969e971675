//! PS/2 keyboard decoding.
//!
//! The keyboard interrupt hands raw scancodes here; decoded unicode
//! characters are pushed into the console input ring.

use pc_keyboard::{DecodedKey, HandleControl, Keyboard, ScancodeSet1, layouts};
use spin::Mutex;

static KEYBOARD: Mutex<Keyboard<layouts::Us104Key, ScancodeSet1>> = Mutex::new(Keyboard::new(
    ScancodeSet1::new(),
    layouts::Us104Key,
    HandleControl::MapLettersToUnicode,
));

/// Decode one scancode byte from the IRQ path.
pub fn handle_scancode(scancode: u8) {
    let mut keyboard = KEYBOARD.lock();
    if let Ok(Some(event)) = keyboard.add_byte(scancode) {
        if let Some(key) = keyboard.process_keyevent(event) {
            match key {
                DecodedKey::Unicode(ch) => super::push_char(ch),
                DecodedKey::RawKey(_) => {}
            }
        }
    }
}
