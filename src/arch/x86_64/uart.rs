//! 16550 UART on COM1, the kernel's log and console output device.

#[cfg(target_os = "none")]
mod hw {
    use x86_64::instructions::port::Port;

    const COM1: u16 = 0x3f8;

    pub fn init() {
        unsafe {
            Port::<u8>::new(COM1 + 1).write(0x00); // disable interrupts
            Port::<u8>::new(COM1 + 3).write(0x80); // DLAB on
            Port::<u8>::new(COM1 + 0).write(0x03); // divisor 3: 38400 baud
            Port::<u8>::new(COM1 + 1).write(0x00);
            Port::<u8>::new(COM1 + 3).write(0x03); // 8N1, DLAB off
            Port::<u8>::new(COM1 + 2).write(0xc7); // FIFO on, cleared, 14-byte threshold
            Port::<u8>::new(COM1 + 4).write(0x0b); // DTR | RTS | OUT2
        }
    }

    pub fn write_byte(byte: u8) {
        unsafe {
            let mut lsr = Port::<u8>::new(COM1 + 5);
            let mut data = Port::<u8>::new(COM1);
            while lsr.read() & 0x20 == 0 {
                core::hint::spin_loop();
            }
            data.write(byte);
        }
    }
}

#[cfg(not(target_os = "none"))]
mod hw {
    pub fn init() {}
    pub fn write_byte(_byte: u8) {}
}

pub fn init() {
    hw::init();
}

pub fn write_byte(byte: u8) {
    if byte == b'\n' {
        hw::write_byte(b'\r');
    }
    hw::write_byte(byte);
}

pub fn write_str(s: &str) {
    for b in s.bytes() {
        write_byte(b);
    }
}
