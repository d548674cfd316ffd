//! Utility functions for the blood-pressure-collector crate.

/// Millimetres of mercury in one kilopascal.
const MMHG_PER_KPA: f64 = 7.500_616_827;

/// Convert kilopascals to millimetres of mercury.
///
/// # Arguments
///
/// * `kpa` - Pressure in kPa
///
/// # Returns
///
/// Pressure in mmHg
///
/// # Example
///
/// ```
/// use blood_pressure_collector::kpa_to_mmhg;
///
/// let mmhg = kpa_to_mmhg(16.0);
/// assert!((mmhg - 120.01).abs() < 0.01);
/// ```
#[inline]
pub fn kpa_to_mmhg(kpa: f64) -> f64 {
    kpa * MMHG_PER_KPA
}

/// Convert millimetres of mercury to kilopascals.
///
/// # Arguments
///
/// * `mmhg` - Pressure in mmHg
///
/// # Returns
///
/// Pressure in kPa
///
/// # Example
///
/// ```
/// use blood_pressure_collector::mmhg_to_kpa;
///
/// let kpa = mmhg_to_kpa(120.0);
/// assert!((kpa - 16.0).abs() < 0.01);
/// ```
#[inline]
pub fn mmhg_to_kpa(mmhg: f64) -> f64 {
    mmhg / MMHG_PER_KPA
}

/// Next identifier from a counter that skips zero and wraps before the sign bit.
///
/// Used for callback and transaction ids, which must stay positive so they
/// can be returned in an `i32` response status.
#[inline]
pub(crate) fn next_id(counter: &mut u32) -> u32 {
    *counter = counter.wrapping_add(1);
    if *counter == 0 || *counter >= 0x8000_0000 {
        *counter = 1;
    }
    *counter
}
