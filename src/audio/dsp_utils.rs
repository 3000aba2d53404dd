// DSP utilities - Audio hygiene shared by note graphs and the master bus

/// Flush denormals to zero
///
/// Very small values slow down some CPUs dramatically. Anything below 1e-15
/// is far under 32-bit float noise, so it is forced to zero.
#[inline]
pub fn flush_denormals_to_zero(x: f32) -> f32 {
    if x.abs() < 1e-15 { 0.0 } else { x }
}

/// Soft clipping with tanh, keeps the bus output inside [-1, 1]
#[inline]
pub fn soft_clip(x: f32) -> f32 {
    x.tanh()
}

/// Normalised tanh waveshaper
///
/// `drive` = 0 is a bypass. Larger values push the curve harder while the
/// normalisation keeps a full-scale input at full scale.
#[inline]
pub fn waveshape(x: f32, drive: f32) -> f32 {
    if drive <= 0.0 {
        return x;
    }
    let k = 1.0 + drive * 10.0;
    (x * k).tanh() / k.tanh()
}

#[inline]
pub fn db_to_gain(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

#[inline]
pub fn gain_to_db(gain: f32) -> f32 {
    20.0 * gain.max(1e-9).log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_denormals() {
        assert_eq!(flush_denormals_to_zero(1e-20), 0.0);
        assert_eq!(flush_denormals_to_zero(-0.25), -0.25);
    }

    #[test]
    fn test_soft_clip_bounds() {
        assert!(soft_clip(10.0) <= 1.0);
        assert!(soft_clip(-10.0) >= -1.0);
        assert!(soft_clip(0.0).abs() < 1e-6);
    }

    #[test]
    fn test_waveshape_bypass_and_full_scale() {
        assert_eq!(waveshape(0.3, 0.0), 0.3);
        assert!((waveshape(1.0, 0.5) - 1.0).abs() < 1e-6);
        // Saturation lifts small signals
        assert!(waveshape(0.2, 0.5) > 0.2);
    }

    #[test]
    fn test_db_conversions() {
        assert!((db_to_gain(0.0) - 1.0).abs() < 1e-6);
        assert!((db_to_gain(-6.0) - 0.501).abs() < 0.001);
        assert!((gain_to_db(db_to_gain(-12.0)) + 12.0).abs() < 1e-3);
    }
}
