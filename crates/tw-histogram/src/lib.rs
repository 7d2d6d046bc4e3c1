#![forbid(unsafe_code)]

//! Fixed-width histograms of tensor values that survive NaN, infinities and
//! extreme magnitudes.
//!
//! Non-finite entries are dropped before the bounds are taken. The bounds are
//! then widened in the tensor's own precision until `bin_count + 1` linearly
//! spaced edges are strictly increasing, so narrow or single-valued data
//! still yields well-formed bins.

use serde::{Deserialize, Serialize};
use tracing::debug;
use tw_core::{DType, DenseTensor, FloatElement, Storage, TensorError};

pub const DEFAULT_NUM_BINS: usize = 64;

// A sqrt(2)-grown multiplier overflows f64 by round 2048, which clamps the
// padded bounds to the full range and ends the search.
const MAX_WIDEN_ROUNDS: usize = 2_100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename = "histogram")]
pub struct HistogramRecord {
    #[serde(rename = "bins")]
    pub bin_edges: Vec<f64>,
    #[serde(rename = "values")]
    pub bin_counts: Vec<u64>,
}

impl HistogramRecord {
    #[must_use]
    pub fn num_bins(&self) -> usize {
        self.bin_counts.len()
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.bin_counts.iter().sum()
    }
}

/// Finite entries of `values`, order preserved.
#[must_use]
pub fn finite_values<T: FloatElement>(values: &[T]) -> Vec<T> {
    values.iter().copied().filter(|value| value.is_finite()).collect()
}

#[must_use]
pub fn has_finite_values(tensor: &DenseTensor) -> bool {
    match tensor.storage() {
        Storage::F32(values) => values.iter().any(|value| value.is_finite()),
        Storage::F64(values) => values.iter().any(|value| value.is_finite()),
    }
}

/// Minimum and maximum of `values`, or `None` when empty.
#[must_use]
pub fn min_max<T: FloatElement>(values: &[T]) -> Option<(T, T)> {
    let (first, rest) = values.split_first()?;
    Some(rest.iter().fold((*first, *first), |(lo, hi), value| {
        (lo.min(*value), hi.max(*value))
    }))
}

/// `steps` evenly spaced samples from `start` to `end`, computed in `T`.
///
/// The lower half is stepped up from `start` and the upper half stepped down
/// from `end`, so both endpoints are reproduced exactly. Offsets are taken as
/// `span * k / intervals`, which keeps them exact near the subnormal range
/// where `span / intervals` would round. Spans too large for that product
/// fall back to a per-step increment, taken from the halved endpoints when
/// the span itself overflows.
#[must_use]
pub fn linspace<T: FloatElement>(start: T, end: T, steps: usize) -> Vec<T> {
    match steps {
        0 => Vec::new(),
        1 => vec![start],
        2 => vec![start, end],
        _ => {
            let intervals = T::cast_from((steps - 1) as f64);
            let span = end - start;
            let exact = (span * intervals).is_finite();
            let step = if span.is_finite() {
                span / intervals
            } else {
                end / intervals - start / intervals
            };
            let offset = |k: usize| {
                let k = T::cast_from(k as f64);
                if exact { span * k / intervals } else { step * k }
            };
            let half = steps / 2;
            (0..steps)
                .map(|idx| {
                    if idx < half {
                        start + offset(idx)
                    } else {
                        end - offset(steps - 1 - idx)
                    }
                })
                .collect()
        }
    }
}

fn strictly_increasing<T: FloatElement>(edges: &[T]) -> bool {
    edges.iter().all(|edge| edge.is_finite()) && edges.windows(2).all(|pair| pair[0] < pair[1])
}

/// Whether `edge_count` samples between `lo` and `hi` are finite and strictly increasing.
#[must_use]
pub fn edges_are_distinct<T: FloatElement>(lo: T, hi: T, edge_count: usize) -> bool {
    strictly_increasing(&linspace(lo, hi, edge_count))
}

/// Widens `[tmin, tmax]` so that [`DEFAULT_NUM_BINS`] bins have distinct edges.
#[must_use]
pub fn widen_min_max<T: FloatElement>(tmin: T, tmax: T) -> (T, T) {
    widen_for_bins(tmin, tmax, DEFAULT_NUM_BINS)
}

/// Widens `[tmin, tmax]` until `bin_count + 1` edges computed with
/// [`linspace`] are strictly increasing in `T`.
///
/// The returned interval always contains the input (which may be given in
/// either order). Padding is added symmetrically in multiples of
/// `eps * max(|midpoint|, tiny)`, grown by a factor of sqrt(2) per round, and
/// clamped to the largest finite magnitude of `T`.
#[must_use]
pub fn widen_for_bins<T: FloatElement>(tmin: T, tmax: T, bin_count: usize) -> (T, T) {
    let (lo, hi) = if tmin <= tmax {
        (tmin, tmax)
    } else {
        (tmax, tmin)
    };
    let edge_count = bin_count.max(1) + 1;
    if edges_are_distinct(lo, hi, edge_count) {
        return (lo, hi);
    }

    let two = T::cast_from(2.0);
    let midpoint = lo / two + hi / two;
    let step = T::epsilon() * midpoint.abs().max(T::min_positive_value());
    let ceiling = T::max_value();
    let growth = T::cast_from(std::f64::consts::SQRT_2);

    let mut multiplier = T::one();
    for _ in 0..MAX_WIDEN_ROUNDS {
        let pad = step * multiplier;
        let lo2 = (lo - pad).max(-ceiling);
        let hi2 = (hi + pad).min(ceiling);
        if edges_are_distinct(lo2, hi2, edge_count) {
            return (lo2, hi2);
        }
        if lo2 == -ceiling && hi2 == ceiling {
            break;
        }
        multiplier = multiplier * growth;
    }
    debug!(
        lo = lo.as_f64(),
        hi = hi.as_f64(),
        bin_count,
        "bounds widened to the full representable range"
    );
    (-ceiling, ceiling)
}

/// [`widen_min_max`] for bounds given as `f64` and evaluated at `dtype` precision.
///
/// For `F32` the inputs are first rounded outward to the nearest `f32`, so the
/// returned bounds still contain the input `f64` interval.
#[must_use]
pub fn widen_bounds(tmin: f64, tmax: f64, dtype: DType) -> (f64, f64) {
    let (lo, hi) = if tmin <= tmax {
        (tmin, tmax)
    } else {
        (tmax, tmin)
    };
    match dtype {
        DType::F32 => {
            let (lo2, hi2) = widen_min_max(round_down_f32(lo), round_up_f32(hi));
            (f64::from(lo2), f64::from(hi2))
        }
        DType::F64 => widen_min_max(lo, hi),
    }
}

fn round_down_f32(value: f64) -> f32 {
    let rounded = saturate_f32(value);
    if f64::from(rounded) > value {
        next_toward_neg_infinity(rounded)
    } else {
        rounded
    }
}

fn round_up_f32(value: f64) -> f32 {
    -round_down_f32(-value)
}

fn saturate_f32(value: f64) -> f32 {
    let rounded = value as f32;
    if rounded.is_infinite() && value.is_finite() {
        f32::MAX.copysign(rounded)
    } else {
        rounded
    }
}

fn next_toward_neg_infinity(value: f32) -> f32 {
    if value == 0.0 {
        -f32::from_bits(1)
    } else if value > 0.0 {
        f32::from_bits(value.to_bits() - 1)
    } else if value > f32::MIN {
        f32::from_bits(value.to_bits() + 1)
    } else {
        value
    }
}

/// Bin holding `value` for strictly increasing `edges`; the last bin is closed.
#[must_use]
pub fn bin_index<T: FloatElement>(edges: &[T], value: T) -> Option<usize> {
    let bins = edges.len().checked_sub(1).filter(|bins| *bins > 0)?;
    let (first, last) = (edges[0], edges[bins]);
    if !(value >= first && value <= last) {
        return None;
    }
    let upper = edges.partition_point(|edge| *edge <= value);
    Some(upper.saturating_sub(1).min(bins - 1))
}

/// Per-bin counts of `values` against `edges`; values outside the edges are ignored.
#[must_use]
pub fn histc<T: FloatElement>(values: &[T], edges: &[T]) -> Vec<u64> {
    let mut counts = vec![0u64; edges.len().saturating_sub(1)];
    for value in values {
        if let Some(bin) = bin_index(edges, *value) {
            counts[bin] += 1;
        }
    }
    counts
}

fn summarize_values<T: FloatElement>(
    values: &[T],
    implicit_zeros: u64,
    bin_count: usize,
) -> Option<HistogramRecord> {
    if bin_count == 0 {
        return None;
    }
    let finite = finite_values(values);
    let (mut tmin, mut tmax) = match min_max(&finite) {
        Some(bounds) => bounds,
        None if implicit_zeros > 0 => (T::zero(), T::zero()),
        None => return None,
    };
    if implicit_zeros > 0 {
        tmin = tmin.min(T::zero());
        tmax = tmax.max(T::zero());
    }

    let (lo, hi) = widen_for_bins(tmin, tmax, bin_count);
    let edges = linspace(lo, hi, bin_count + 1);
    let mut counts = histc(&finite, &edges);
    if implicit_zeros > 0 {
        if let Some(bin) = bin_index(&edges, T::zero()) {
            counts[bin] += implicit_zeros;
        }
    }

    Some(HistogramRecord {
        bin_edges: edges.into_iter().map(T::as_f64).collect(),
        bin_counts: counts,
    })
}

/// Histogram of the finite values of `tensor`, or `None` when it has none.
#[must_use]
pub fn summarize(tensor: &DenseTensor, bin_count: usize) -> Option<HistogramRecord> {
    summarize_with_implicit_zeros(tensor, 0, bin_count)
}

/// Like [`summarize`], for a tensor that stores only its non-zero entries;
/// `implicit_zeros` more zeros are counted in the bin containing zero.
#[must_use]
pub fn summarize_with_implicit_zeros(
    tensor: &DenseTensor,
    implicit_zeros: u64,
    bin_count: usize,
) -> Option<HistogramRecord> {
    let record = match tensor.storage() {
        Storage::F32(values) => summarize_values(values, implicit_zeros, bin_count),
        Storage::F64(values) => summarize_values(values, implicit_zeros, bin_count),
    };
    if record.is_none() {
        debug!(
            tensor = tensor.id(),
            numel = tensor.numel(),
            "no finite values to summarize"
        );
    }
    record
}

/// One histogram over the flattened concatenation of `tensors`.
pub fn summarize_many(
    tensors: &[DenseTensor],
    bin_count: usize,
) -> Result<Option<HistogramRecord>, TensorError> {
    let joined = DenseTensor::concat_flat(tensors)?;
    Ok(summarize(&joined, bin_count))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tw_core::{DType, DenseTensor, FloatElement};

    use super::{
        DEFAULT_NUM_BINS, HistogramRecord, bin_index, finite_values, has_finite_values, histc,
        linspace, min_max, summarize, summarize_many, summarize_with_implicit_zeros,
        widen_bounds, widen_for_bins, widen_min_max,
    };

    fn tensor32(values: &[f32]) -> DenseTensor {
        DenseTensor::from_f32(values.to_vec(), vec![values.len()]).expect("rank-1 tensor")
    }

    fn assert_well_formed(record: &HistogramRecord, bins: usize, finite: u64) {
        assert_eq!(record.bin_edges.len(), bins + 1);
        assert_eq!(record.bin_counts.len(), bins);
        assert!(
            record.bin_edges.windows(2).all(|pair| pair[0] < pair[1]),
            "edges must be strictly increasing: {:?}",
            record.bin_edges
        );
        assert_eq!(record.total(), finite);
    }

    fn interesting_values(high: f64, eps: f64, tiny: f64) -> Vec<f64> {
        let mut values = vec![
            -2.0,
            -1.0,
            0.0,
            1.0,
            2.0,
            -high,
            -high * (1.0 - eps),
            -high * (1.0 - 65.0 * eps),
            -eps * tiny,
            -2.0 * eps * tiny,
            -66.0 * eps * tiny,
            eps * tiny,
            2.0 * eps * tiny,
            66.0 * eps * tiny,
            high,
            high * (1.0 - eps),
            high * (1.0 - 65.0 * eps),
        ];
        values.sort_by(f64::total_cmp);
        values
    }

    fn check_widening<T: FloatElement>(values: &[T], high: f64) {
        let info = T::DTYPE.finfo();
        for (i, tmin) in values.iter().copied().enumerate() {
            for tmax in values[i..].iter().copied() {
                let (tmin2, tmax2) = widen_min_max(tmin, tmax);
                let (lo, hi) = (tmin.as_f64(), tmax.as_f64());
                let (lo2, hi2) = (tmin2.as_f64(), tmax2.as_f64());

                let limit = high * (1.0 + 32.0 * info.eps);
                assert!(
                    -limit <= lo2 && lo2 < hi2 && hi2 <= limit,
                    "magnitude escaped for ({lo:e}, {hi:e}): ({lo2:e}, {hi2:e})"
                );
                assert!(hi2 - lo2 >= hi - lo, "width shrank for ({lo:e}, {hi:e})");

                let middle = (lo + hi) / 2.0;
                let step = info.eps * middle.abs().max(info.tiny);
                assert!(lo - lo2 <= 100.0 * step, "lower bound moved too far for ({lo:e}, {hi:e})");
                assert!(hi2 - hi <= 100.0 * step, "upper bound moved too far for ({lo:e}, {hi:e})");

                let edges = linspace(tmin2, tmax2, DEFAULT_NUM_BINS + 1);
                let mut distinct = edges.iter().map(|edge| edge.as_f64()).collect::<Vec<_>>();
                distinct.dedup();
                assert_eq!(distinct.len(), 65, "edges collapsed for ({lo:e}, {hi:e})");
            }
        }
    }

    #[test]
    fn widening_holds_for_interesting_f32_bounds() {
        let info = DType::F32.finfo();
        let values = interesting_values(1e30, info.eps, info.tiny)
            .into_iter()
            .map(|value| value as f32)
            .collect::<Vec<_>>();
        check_widening(&values, f64::from(1e30f32));
    }

    #[test]
    fn widening_holds_for_interesting_f64_bounds() {
        let info = DType::F64.finfo();
        let values = interesting_values(1e300, info.eps, info.tiny);
        check_widening(&values, 1e300);
    }

    fn assert_minimal_expansion(lo: f64, hi: f64, lo2: f64, hi2: f64, eps: f64, tiny: f64) {
        let step = eps * ((lo + hi) / 2.0).abs().max(tiny);
        assert!(
            lo2 <= lo && hi2 >= hi,
            "({lo:e}, {hi:e}) -> ({lo2:e}, {hi2:e})"
        );
        assert!(
            (lo - lo2) / step <= 100.0 && (hi2 - hi) / step <= 100.0,
            "({lo:e}, {hi:e}) -> ({lo2:e}, {hi2:e}) moved {} / {} steps",
            (lo - lo2) / step,
            (hi2 - hi) / step
        );
    }

    #[test]
    fn widening_stays_minimal_just_above_smallest_normal_f32() {
        let info = DType::F32.finfo();
        for exponent in [-126, -125, -124] {
            let lo = 2.0f32.powi(exponent);
            for ulps in 0..80 {
                let hi = f32::from_bits(lo.to_bits() + ulps);
                let (lo2, hi2) = widen_min_max(lo, hi);
                let edges = linspace(lo2, hi2, DEFAULT_NUM_BINS + 1);
                assert!(edges.windows(2).all(|pair| pair[0] < pair[1]));
                assert_minimal_expansion(
                    f64::from(lo),
                    f64::from(hi),
                    f64::from(lo2),
                    f64::from(hi2),
                    info.eps,
                    info.tiny,
                );
            }
        }
    }

    #[test]
    fn widening_stays_minimal_just_above_smallest_normal_f64() {
        let info = DType::F64.finfo();
        for exponent in [-1022, -1021, -1020] {
            let lo = 2.0f64.powi(exponent);
            for ulps in 0..80 {
                let hi = f64::from_bits(lo.to_bits() + ulps);
                let (lo2, hi2) = widen_min_max(lo, hi);
                let edges = linspace(lo2, hi2, DEFAULT_NUM_BINS + 1);
                assert!(edges.windows(2).all(|pair| pair[0] < pair[1]));
                assert_minimal_expansion(lo, hi, lo2, hi2, info.eps, info.tiny);
            }
        }
    }

    #[test]
    fn subnormal_spans_give_exact_offsets() {
        let lo = 2.0f32.powi(-125);
        let ulp = f32::from_bits(1) * 2.0;
        let edges = linspace(lo, lo + 64.0 * ulp, 65);
        for (idx, edge) in edges.iter().enumerate() {
            assert_eq!(*edge, lo + idx as f32 * ulp, "edge {idx}");
        }
    }

    #[test]
    fn wide_bounds_are_returned_unchanged() {
        assert_eq!(widen_min_max(-1.0f64, 3.0), (-1.0, 3.0));
        assert_eq!(widen_min_max(0.0f32, 64.0), (0.0, 64.0));
    }

    #[test]
    fn reversed_bounds_are_oriented() {
        assert_eq!(widen_min_max(3.0f64, -1.0), (-1.0, 3.0));
        let (lo, hi) = widen_min_max(1.0f32, 1.0);
        assert!(lo < 1.0 && hi > 1.0);
    }

    #[test]
    fn widening_never_leaves_the_finite_range() {
        let (lo, hi) = widen_min_max(f32::MAX, f32::MAX);
        assert!(lo < f32::MAX);
        assert_eq!(hi, f32::MAX);
        let (lo, hi) = widen_min_max(f64::MIN, f64::MIN);
        assert_eq!(lo, f64::MIN);
        assert!(hi > f64::MIN);
        assert_eq!(widen_min_max(f64::MIN, f64::MAX), (f64::MIN, f64::MAX));
    }

    #[test]
    fn widening_scales_with_bin_count() {
        let (lo, hi) = widen_for_bins(0.5f32, 0.5, 1_000);
        let edges = linspace(lo, hi, 1_001);
        assert!(edges.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(lo <= 0.5 && hi >= 0.5);
    }

    #[test]
    fn widen_bounds_contains_f64_input_at_f32_precision() {
        let (lo, hi) = widen_bounds(0.1, 0.1, DType::F32);
        assert!(lo <= 0.1 && hi >= 0.1);
        let edges = linspace(lo as f32, hi as f32, 65);
        assert!(edges.windows(2).all(|pair| pair[0] < pair[1]));

        let (lo, hi) = widen_bounds(1e39, 1e39, DType::F32);
        assert!(lo < hi);
        assert_eq!(hi, f64::from(f32::MAX));

        assert_eq!(widen_bounds(2.0, -2.0, DType::F64), (-2.0, 2.0));
    }

    #[test]
    fn linspace_reproduces_endpoints() {
        let edges = linspace(-3.0f64, 5.0, 9);
        assert_eq!(edges, vec![-3.0, -2.0, -1.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(linspace(1.0f32, 2.0, 1), vec![1.0]);
        assert!(linspace(1.0f32, 2.0, 0).is_empty());

        let full = linspace(f64::MIN, f64::MAX, 65);
        assert_eq!(full[0], f64::MIN);
        assert_eq!(full[64], f64::MAX);
        assert!(full.iter().all(|edge| edge.is_finite()));
    }

    #[test]
    fn histc_puts_right_edge_in_last_bin() {
        let edges = [0.0f64, 1.0, 2.0, 3.0];
        assert_eq!(histc(&[0.0, 0.5, 1.0, 2.5, 3.0], &edges), vec![2, 1, 2]);
        assert_eq!(bin_index(&edges, 3.0), Some(2));
        assert_eq!(bin_index(&edges, -0.1), None);
        assert_eq!(bin_index(&edges, f64::NAN), None);
        assert_eq!(bin_index(&[1.0f64], 1.0), None);
    }

    #[test]
    fn finite_filtering_and_bounds() {
        assert_eq!(
            finite_values(&[0.0f32, f32::INFINITY, f32::NEG_INFINITY, f32::NAN, 2.0]),
            vec![0.0, 2.0]
        );
        assert_eq!(min_max(&[3.0f64, -1.0, 2.0]), Some((-1.0, 3.0)));
        assert_eq!(min_max::<f64>(&[]), None);
    }

    #[test]
    fn detects_tensors_without_finite_values() {
        let cases: [(&[f32], bool); 10] = [
            (&[1.0, 2.0, 3.0], true),
            (&[0.0, 0.0, 0.0], true),
            (&[1.0], true),
            (&[], false),
            (&[1.0, f32::NAN, f32::NAN], true),
            (&[1.0, f32::INFINITY, f32::NEG_INFINITY], true),
            (&[1.0, f32::NAN, f32::INFINITY], true),
            (&[f32::NAN, f32::NAN, f32::NAN], false),
            (&[f32::INFINITY, f32::INFINITY, f32::NEG_INFINITY], false),
            (&[f32::NAN, f32::INFINITY, f32::NEG_INFINITY], false),
        ];
        for (values, expected) in cases {
            let tensor = tensor32(values);
            assert_eq!(has_finite_values(&tensor), expected, "{values:?}");
            assert_eq!(summarize(&tensor, 64).is_some(), expected, "{values:?}");
        }
    }

    #[test]
    fn single_finite_value_among_non_finite_is_summarized() {
        let record = summarize(&tensor32(&[1.0, f32::NAN, f32::INFINITY]), 64)
            .expect("one finite value is enough");
        assert_well_formed(&record, 64, 1);
        assert!(record.bin_edges[0] <= 1.0 && record.bin_edges[64] >= 1.0);
    }

    #[test]
    fn constant_tensor_gets_full_bin_count() {
        let tensor = DenseTensor::full(vec![4, 4], 0.25, DType::F64);
        let record = summarize(&tensor, 64).expect("finite tensor");
        assert_well_formed(&record, 64, 16);
    }

    #[test]
    fn extreme_magnitudes_stay_finite() {
        let record =
            summarize(&tensor32(&[f32::MAX, f32::MIN, 0.0]), 64).expect("finite tensor");
        assert_well_formed(&record, 64, 3);
        assert_eq!(record.bin_edges[0], f64::from(f32::MIN));
        assert_eq!(record.bin_edges[64], f64::from(f32::MAX));
        assert_eq!(record.bin_counts[0], 1);
        assert_eq!(record.bin_counts[63], 1);
    }

    #[test]
    fn record_serializes_with_type_tag() {
        let tensor = DenseTensor::from_f64(vec![0.0, 1.0, 2.0, 3.0], vec![4]).expect("tensor");
        let record = summarize(&tensor, 2).expect("finite tensor");
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["_type"], "histogram");
        assert_eq!(json["bins"], serde_json::json!([0.0, 1.5, 3.0]));
        assert_eq!(json["values"], serde_json::json!([2, 2]));

        let back: HistogramRecord = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, record);
    }

    #[test]
    fn implicit_zeros_extend_range_and_land_in_zero_bin() {
        let tensor = DenseTensor::from_f64(vec![2.0, 4.0], vec![2]).expect("tensor");
        let record = summarize_with_implicit_zeros(&tensor, 10, 4).expect("non-empty");
        assert_well_formed(&record, 4, 12);
        assert_eq!(record.bin_edges[0], 0.0);
        assert_eq!(record.bin_counts[0], 10);

        let empty = DenseTensor::from_f64(Vec::new(), vec![0]).expect("tensor");
        let record = summarize_with_implicit_zeros(&empty, 3, 8).expect("zeros only");
        assert_well_formed(&record, 8, 3);
    }

    #[test]
    fn zero_bins_yield_nothing() {
        assert!(summarize(&tensor32(&[1.0, 2.0]), 0).is_none());
    }

    #[test]
    fn summarize_many_joins_tensors() {
        let a = tensor32(&[1.0, 2.0]);
        let b = DenseTensor::from_f64(vec![3.0, f64::NAN], vec![2, 1]).expect("tensor");
        let record = summarize_many(&[a, b], 8)
            .expect("concat")
            .expect("finite values");
        assert_well_formed(&record, 8, 3);
        assert!(summarize_many(&[], 8).is_err());
    }

    proptest! {
        #[test]
        fn prop_summary_counts_every_finite_value(
            values in prop::collection::vec(
                prop_oneof![
                    8 => -1.0e6f64..1.0e6,
                    1 => Just(f64::NAN),
                    1 => Just(f64::INFINITY),
                    1 => Just(f64::NEG_INFINITY),
                ],
                0..64,
            ),
            bins in 1usize..=96,
        ) {
            let finite = values.iter().filter(|value| value.is_finite()).count() as u64;
            let tensor = DenseTensor::from_f64(values.clone(), vec![values.len()]).expect("tensor");
            match summarize(&tensor, bins) {
                None => prop_assert_eq!(finite, 0),
                Some(record) => {
                    prop_assert_eq!(record.bin_edges.len(), bins + 1);
                    prop_assert_eq!(record.bin_counts.len(), bins);
                    prop_assert!(record.bin_edges.windows(2).all(|pair| pair[0] < pair[1]));
                    prop_assert_eq!(record.total(), finite);
                }
            }
        }

        #[test]
        fn prop_f32_widening_yields_distinct_edges(a in any::<f32>(), b in any::<f32>()) {
            prop_assume!(a.is_finite() && b.is_finite());
            let (lo, hi) = widen_min_max(a, b);
            prop_assert!(lo <= a.min(b) && hi >= a.max(b));
            prop_assert!(lo.is_finite() && hi.is_finite());
            let edges = linspace(lo, hi, DEFAULT_NUM_BINS + 1);
            prop_assert!(edges.windows(2).all(|pair| pair[0] < pair[1]));
        }

        #[test]
        fn prop_f64_widening_yields_distinct_edges(a in any::<f64>(), b in any::<f64>()) {
            prop_assume!(a.is_finite() && b.is_finite());
            let (lo, hi) = widen_min_max(a, b);
            prop_assert!(lo <= a.min(b) && hi >= a.max(b));
            prop_assert!(hi - lo >= (b - a).abs() || !(hi - lo).is_finite());
            let edges = linspace(lo, hi, DEFAULT_NUM_BINS + 1);
            prop_assert!(edges.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }
}
