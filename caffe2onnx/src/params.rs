//! Expansion of Caffe spatial parameters into the ONNX layout.
//!
//! Caffe lets a layer give its padding, stride, dilation and kernel size as a list of zero,
//! one or two values, where a single value applies to both spatial axes. ONNX wants the
//! explicit per-axis form, with padding split into begin and end values:
//! `[h_begin, w_begin, h_end, w_end]`.

use crate::error::{ConvertError, Result};

/// Expands a Caffe spatial parameter list into `[h_begin, w_begin, h_end, w_end]`.
///
/// * no value: every entry is `default`
/// * one value: isotropic, every entry is that value
/// * two values `[h, w]`: `[h, w, h, w]`
///
/// Strides, dilations and kernel shapes only need the first two entries.
pub fn expand_spatial<T>(param: &[T], default: i64) -> Result<[i64; 4]>
where
    T: Copy + Into<i64>,
{
    match *param {
        [] => Ok([default; 4]),
        [v] => Ok([v.into(); 4]),
        [h, w] => {
            let (h, w) = (h.into(), w.into());
            Ok([h, w, h, w])
        }
        _ => Err(ConvertError::invalid(format!(
            "spatial parameter must have 0, 1 or 2 values, got {}",
            param.len()
        ))),
    }
}

/// Per-axis `[h, w]` form of a spatial parameter, for strides, dilations and kernel shapes.
pub fn expand_axes<T>(param: &[T], default: i64) -> Result<Vec<i64>>
where
    T: Copy + Into<i64>,
{
    Ok(expand_spatial(param, default)?[..2].to_vec())
}

/// Picks the explicit `*_h` / `*_w` pair when both are set, otherwise the generic list.
pub(crate) fn with_hw(generic: &[u32], h: Option<u32>, w: Option<u32>) -> Vec<u32> {
    match (h, w) {
        (Some(h), Some(w)) => vec![h, w],
        _ => generic.to_vec(),
    }
}
