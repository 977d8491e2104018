// SPDX-License-Identifier: MIT
// Copyright (C) 2025 The Eldboot Project

//! 8-bit two's-complement checksums as used by the ACPI tables.

/// Wrapping byte sum over `bytes`.
pub fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// A table checksums clean when its bytes sum to zero.
pub fn ok(bytes: &[u8]) -> bool {
    sum(bytes) == 0
}

/// Rewrite the checksum byte at `at` so that `bytes` sums to zero.
pub fn fixup(bytes: &mut [u8], at: usize) {
    bytes[at] = 0;
    bytes[at] = sum(bytes).wrapping_neg();
}
