//! Numeric helpers shared by the capture, display and export paths.

/// Magnitude of the most negative 16-bit sample.
pub const PEAK: f32 = 32_768.0;

/// Normalised min/max of a span of samples.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleRange {
    pub min: f32,
    pub max: f32,
}

/// Scans `samples[start..end]` for its extremes, normalised to [-1, 1].
///
/// Bounds are clamped to the buffer. Long spans are strided (at most 100
/// samples apart) so this stays cheap enough to call once per display column.
pub fn range(samples: &[i16], start: usize, end: usize) -> SampleRange {
    if samples.is_empty() {
        return SampleRange::default();
    }

    let last = samples.len() - 1;
    let start = start.min(last);
    let end = end.min(last).max(start);
    let skip = (((end - start) as f32 / 10.0).round() as usize).clamp(1, 100);

    let mut min = 0_i16;
    let mut max = 0_i16;
    for &value in samples[start..end].iter().step_by(skip) {
        min = min.min(value);
        max = max.max(value);
    }

    SampleRange {
        min: f32::from(min) / PEAK,
        max: f32::from(max) / PEAK,
    }
}

/// Converts a normalised float sample to 16 bits. Negative values scale by
/// 32768 and non-negative values by 32767 so both ends of the range map
/// exactly.
#[inline]
pub fn to_int(sample: f32) -> i16 {
    let sample = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if sample < 0.0 {
        (sample * PEAK) as i16
    } else {
        (sample * (PEAK - 1.0)) as i16
    }
}

/// Inverse of [`to_int`].
#[inline]
pub fn to_float(sample: i16) -> f32 {
    if sample < 0 {
        f32::from(sample) / PEAK
    } else {
        f32::from(sample) / (PEAK - 1.0)
    }
}

pub fn to_float_buffer(samples: &[i16]) -> Vec<f32> {
    samples.iter().copied().map(to_float).collect()
}

pub fn sign(value: f32) -> f32 {
    if value < 0.0 {
        -1.0
    } else {
        1.0
    }
}

/// Sign-preserving power, used for perceptual gain curves.
pub fn power(value: f32, exponent: f32) -> f32 {
    sign(value) * value.abs().powf(exponent)
}

/// Center frequencies of `buckets` log-spaced buckets spanning
/// `[low, high]`. Always non-decreasing.
pub fn log_centers(buckets: usize, low: f32, high: f32) -> Vec<f32> {
    let low = low.max(f32::MIN_POSITIVE);
    let high = high.max(low);
    match buckets {
        0 => Vec::new(),
        1 => vec![low],
        _ => {
            let ratio = high / low;
            let steps = (buckets - 1) as f32;
            (0..buckets)
                .map(|bucket| low * ratio.powf(bucket as f32 / steps))
                .collect()
        }
    }
}

/// Resamples `values`, linearly spaced over `[from_min, from_max]`, onto
/// `buckets` logarithmically spaced points over `[to_min, to_max]`.
pub fn log_space(
    values: &[f32],
    from_min: f32,
    from_max: f32,
    to_min: f32,
    to_max: f32,
    buckets: usize,
) -> Vec<f32> {
    if values.is_empty() {
        return vec![0.0; buckets];
    }

    let last = (values.len() - 1) as f32;
    let span = (from_max - from_min).max(f32::EPSILON);
    log_centers(buckets, to_min, to_max)
        .into_iter()
        .map(|frequency| {
            let position = ((frequency - from_min) / span * values.len() as f32).clamp(0.0, last);
            interpolate(values, position)
        })
        .collect()
}

fn interpolate(values: &[f32], position: f32) -> f32 {
    let index = position.floor() as usize;
    let fraction = position - index as f32;
    match values.get(index + 1) {
        Some(next) => values[index] + (next - values[index]) * fraction,
        None => values[index],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_float_round_trip_within_one_step() {
        for &sample in &[-1.0_f32, -0.75, -0.5, -0.123_456, 0.0, 0.2, 0.5, 0.999, 1.0] {
            let back = to_float(to_int(sample));
            let step = if sample < 0.0 { 1.0 / PEAK } else { 1.0 / (PEAK - 1.0) };
            assert!((back - sample).abs() <= step, "{sample} -> {back}");
        }
    }

    #[test]
    fn asymmetric_scaling_hits_both_extremes() {
        assert_eq!(to_int(-1.0), i16::MIN);
        assert_eq!(to_int(1.0), i16::MAX);
        assert_eq!(to_float(i16::MIN), -1.0);
        assert_eq!(to_float(i16::MAX), 1.0);
        assert_eq!(to_int(2.0), i16::MAX);
        assert_eq!(to_int(f32::NAN), 0);
    }

    #[test]
    fn range_reports_normalised_extremes() {
        let mut samples = vec![0_i16; 100];
        samples[10] = 16_384;
        samples[20] = -8_192;
        let found = range(&samples, 0, 100);
        assert_eq!(found.max, 0.5);
        assert_eq!(found.min, -0.25);
        assert_eq!(range(&[], 0, 10), SampleRange::default());
        assert_eq!(range(&samples, 50, 10), SampleRange::default());
    }

    #[test]
    fn power_keeps_sign() {
        assert_eq!(power(0.5, 2.0), 0.25);
        assert_eq!(power(-0.5, 2.0), -0.25);
    }

    #[test]
    fn log_space_has_requested_count_and_monotonic_centers() {
        for &(len, buckets) in &[(2048_usize, 128_usize), (128, 128), (300, 7), (10, 1)] {
            let values: Vec<f32> = (0..len).map(|i| i as f32).collect();
            let out = log_space(&values, 0.0, 22_050.0, 20.0, 22_050.0, buckets);
            assert_eq!(out.len(), buckets);
            let centers = log_centers(buckets, 20.0, 22_050.0);
            assert!(centers.windows(2).all(|pair| pair[0] <= pair[1]));
            // monotonic input maps to monotonic output
            assert!(out.windows(2).all(|pair| pair[0] <= pair[1]));
        }
    }

    #[test]
    fn log_space_endpoints() {
        let values: Vec<f32> = (0..1000).map(|i| i as f32).collect();
        let out = log_space(&values, 0.0, 1000.0, 10.0, 1000.0, 3);
        assert!((out[0] - 10.0).abs() < 1e-3);
        assert!((out[1] - 100.0).abs() < 1e-3);
        assert_eq!(out[2], 999.0);
    }
}
