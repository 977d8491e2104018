// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! Byte-wide port I/O behind a trait, so the stage binaries supply the
//! real `in`/`out` backend and the settle-delay convention for old-style
//! device registers (8259, 8254, RTC) is shared rather than re-spelled
//! at each call site.

/// ISA-style 8-bit port access.
///
/// Writes to old-style device registers need a settle delay before the
/// device accepts the next one; `outb_wait` bounces a dummy byte off the
/// POST-code port for that.
pub trait PortIo {
    fn outb(&mut self, port: u16, val: u8);
    fn inb(&mut self, port: u16) -> u8;

    fn io_delay(&mut self) {
        self.outb(POST_PORT, 0);
    }

    fn outb_wait(&mut self, port: u16, val: u8) {
        self.outb(port, val);
        self.io_delay();
    }
}

/// Traditional POST diagnostic port, decoded by nothing we care about.
pub const POST_PORT: u16 = 0x80;

#[cfg(test)]
pub(crate) mod testutil {
    use super::PortIo;

    /// Records every `(port, value)` write and replays scripted reads.
    pub struct PortLog {
        pub writes: Vec<(u16, u8)>,
        pub reads: Vec<(u16, u8)>,
        read_at: usize,
    }

    impl PortLog {
        pub fn new(reads: Vec<(u16, u8)>) -> Self {
            Self { writes: Vec::new(), reads, read_at: 0 }
        }

        /// Writes with the settle traffic on port 0x80 stripped.
        pub fn device_writes(&self) -> Vec<(u16, u8)> {
            self.writes
                .iter()
                .copied()
                .filter(|(p, _)| *p != super::POST_PORT)
                .collect()
        }
    }

    impl PortIo for PortLog {
        fn outb(&mut self, port: u16, val: u8) {
            self.writes.push((port, val));
        }

        fn inb(&mut self, port: u16) -> u8 {
            let (want, val) = self.reads[self.read_at];
            assert_eq!(port, want, "read from unexpected port");
            self.read_at += 1;
            val
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::PortLog;
    use super::*;

    #[test]
    fn outb_wait_settles_through_post_port() {
        let mut io = PortLog::new(Vec::new());
        io.outb_wait(0x20, 0x11);
        assert_eq!(io.writes, vec![(0x20, 0x11), (POST_PORT, 0)]);
        assert_eq!(io.device_writes(), vec![(0x20, 0x11)]);
    }
}
