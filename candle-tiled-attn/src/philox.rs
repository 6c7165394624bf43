//! Philox4x32-10 counter-based generator.
//!
//! The output for a `(seed, counter)` pair does not depend on any other call, so the
//! dropout mask of an attention entry can be regenerated from its coordinates alone.

const PHILOX_M0: u32 = 0xD251_1F53;
const PHILOX_M1: u32 = 0xCD9E_8D57;
const PHILOX_W0: u32 = 0x9E37_79B9;
const PHILOX_W1: u32 = 0xBB67_AE85;
const PHILOX_ROUNDS: usize = 10;

/// 2^-24, maps the top 24 bits of a lane onto `[0, 1)` without rounding up to one.
const UINT24_TO_UNIFORM: f32 = 1.0 / 16_777_216.0;

#[inline]
fn mulhilo(a: u32, b: u32) -> (u32, u32) {
    let prod = a as u64 * b as u64;
    ((prod >> 32) as u32, prod as u32)
}

/// Runs the ten Philox rounds over a 128-bit counter with a 64-bit key.
pub fn philox4x32_10(counter: [u32; 4], key: [u32; 2]) -> [u32; 4] {
    let mut c = counter;
    let mut k = key;
    for _ in 0..PHILOX_ROUNDS {
        let (hi0, lo0) = mulhilo(PHILOX_M0, c[0]);
        let (hi1, lo1) = mulhilo(PHILOX_M1, c[2]);
        c = [hi1 ^ c[1] ^ k[0], lo1, hi0 ^ c[3] ^ k[1], lo0];
        k = [k[0].wrapping_add(PHILOX_W0), k[1].wrapping_add(PHILOX_W1)];
    }
    c
}

/// First Philox lane for `(seed, offset)` as a 32-bit integer.
#[inline]
pub fn philox_u32(seed: u64, offset: u64) -> u32 {
    let counter = [offset as u32, (offset >> 32) as u32, 0, 0];
    let key = [seed as u32, (seed >> 32) as u32];
    philox4x32_10(counter, key)[0]
}

/// Uniform float in `[0, 1)` for `(seed, offset)`.
#[inline]
pub fn philox_uniform(seed: u64, offset: u64) -> f32 {
    (philox_u32(seed, offset) >> 8) as f32 * UINT24_TO_UNIFORM
}
