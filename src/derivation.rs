//! Pure numeric derivations shared by ingestion-time enrichment, alert
//! evaluation and the display units of zone overviews.
//!
//! Alert thresholds for VPD are calibrated against these exact constants, so
//! the formula must not be "improved" without recalibrating the phase table.

/// Lowest deficit ever reported, in kPa.
pub const VPD_FLOOR_KPA: f64 = 0.1;

/// Saturation vapor pressure of air at `temp_c`, in kPa (Tetens).
pub fn saturation_vapor_pressure(temp_c: f64) -> f64 {
    0.6108 * ((17.27 * temp_c) / (temp_c + 237.3)).exp()
}

/// Vapor pressure deficit in kPa for an air temperature and relative humidity.
///
/// Floored at [`VPD_FLOOR_KPA`] so sensor noise near saturation never yields a
/// non-physical zero or negative deficit.
pub fn vapor_pressure_deficit(temp_c: f64, rel_humidity_pct: f64) -> f64 {
    // ---
    let svp = saturation_vapor_pressure(temp_c);
    let avp = svp * (rel_humidity_pct / 100.0);
    (svp - avp).max(VPD_FLOOR_KPA)
}

/// Celsius to Fahrenheit.
pub fn fahrenheit(celsius: f64) -> f64 {
    (celsius * 9.0 / 5.0) + 32.0
}

/// EC (mS/cm) to PPM on the 500 (US) scale.
pub fn ec_to_ppm_500(ec_ms: f64) -> i64 {
    (ec_ms * 500.0) as i64
}

/// EC (mS/cm) to PPM on the 700 (EU) scale.
pub fn ec_to_ppm_700(ec_ms: f64) -> i64 {
    (ec_ms * 700.0) as i64
}
