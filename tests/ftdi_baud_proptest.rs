//! Property-based tests for the FTDI baud rate encoding.
//!
//! Uses `proptest` to generate rates across the usable range and verify
//! that the encoded (value, index) register pair decodes back to an
//! effective baud rate within tolerance of the request.

use proptest::prelude::*;

use usbuart::driver::ftdi::compute_divisors;

/// The sub-integer prescaler selector, as the chip documents it.
const MAPPER: [u16; 8] = [
    0x0000, 0xC000, 0x8000, 0x0100, 0x4000, 0x4100, 0x8100, 0xC100,
];

/// Reverse the register encoding into the effective baud rate the chip
/// would actually generate.
fn effective_baud(value: u16, index: u16, high_speed: bool) -> f64 {
    let clk: f64 = if high_speed { 120e6 } else { 48e6 };
    let prescaler: f64 = if index & 0x0200 != 0 { 10.0 } else { 16.0 };

    let frac_pattern = (value & 0xC000) | (index & 0x0100);
    let sub = MAPPER
        .iter()
        .position(|&m| m == frac_pattern)
        .expect("unknown sub-divisor pattern") as f64;
    let divisor = f64::from(value & 0x3FFF) * 8.0 + sub;
    assert!(divisor > 0.0, "zero divisor for value={value:#06x}");

    clk * 8.0 / (prescaler * divisor)
}

fn within_tolerance(requested: u32, actual: f64, tolerance: f64) -> bool {
    let requested = requested as f64;
    (actual - requested).abs() / requested <= tolerance
}

proptest! {
    /// Low-speed parts: any rate the 14-bit divisor can resolve decodes
    /// back within 3%.
    #[test]
    fn low_speed_round_trips(baud in 200u32..=1_000_000) {
        let (value, index) = compute_divisors(baud, false);
        let actual = effective_baud(value, index, false);
        prop_assert!(
            within_tolerance(baud, actual, 0.03),
            "baud={} -> ({:#06x},{:#06x}) -> {:.0}",
            baud, value, index, actual
        );
    }

    /// H parts switch to the 120 MHz clock above the divisor-overflow
    /// limit; the round-trip must hold on both sides of it.
    #[test]
    fn high_speed_round_trips(baud in 500u32..=3_000_000) {
        let (value, index) = compute_divisors(baud, true);
        let actual = effective_baud(value, index, true);
        prop_assert!(
            within_tolerance(baud, actual, 0.03),
            "baud={} -> ({:#06x},{:#06x}) -> {:.0}",
            baud, value, index, actual
        );
    }
}

#[test]
fn fixed_rate_vectors() {
    let rates = [
        300u32, 1_200, 9_600, 19_200, 38_400, 115_200, 230_400, 1_000_000, 3_000_000,
    ];
    for baud in rates {
        let (value, index) = compute_divisors(baud, false);
        let actual = effective_baud(value, index, false);
        assert!(
            within_tolerance(baud, actual, 0.03),
            "low-speed baud={baud} -> ({value:#06x},{index:#06x}) -> {actual:.0}"
        );
    }
    for baud in [1_000_000u32, 3_000_000] {
        let (value, index) = compute_divisors(baud, true);
        let actual = effective_baud(value, index, true);
        assert!(
            within_tolerance(baud, actual, 0.03),
            "high-speed baud={baud} -> ({value:#06x},{index:#06x}) -> {actual:.0}"
        );
    }
}

#[test]
fn divisor_9600_matches_datasheet_worked_example() {
    // (48e6 * 8 / 9600 + 7) / 16 = 2500 = 312 * 8 + 4; mapper[4] = 0x4000.
    let (value, index) = compute_divisors(9_600, false);
    assert_eq!(value, 0x4138);
    assert_eq!(index, 0x0000);
    let actual = effective_baud(value, index, false);
    assert!((actual - 9_600.0).abs() < 1.0);
}
