//! Boolean bitfield packing for the compact input wire format.
//!
//! Bit 0 is the LSB, bit 7 the MSB. Both directions must agree on this
//! order; the input codec tests pin it.

/// Pack 8 booleans into a byte. `d0` lands in the LSB.
#[allow(clippy::too_many_arguments)]
pub fn pack_bits(d0: bool, d1: bool, d2: bool, d3: bool, d4: bool, d5: bool, d6: bool, d7: bool) -> u8 {
    let mut b = 0u8;
    for (i, d) in [d0, d1, d2, d3, d4, d5, d6, d7].into_iter().enumerate() {
        if d {
            b |= 1 << i;
        }
    }
    b
}

/// Unpack a byte into 8 booleans. The LSB comes back first.
pub fn unpack_bits(b: u8) -> [bool; 8] {
    let mut out = [false; 8];
    for (i, d) in out.iter_mut().enumerate() {
        *d = b & (1 << i) != 0;
    }
    out
}
