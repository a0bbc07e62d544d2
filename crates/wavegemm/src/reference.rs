//! Host-side reference implementation and synthetic input generation, used
//! to verify GPU results and to fill the input buffers before upload.

use half::f16;

use crate::config::{Elem, InputPattern};

/// Scalar row-major matrix product, `lhs` is M x K and `rhs` is K x N.
///
/// Accumulates in f64 so verification tolerances measure the GPU kernel, not
/// the reference.
pub fn matmul_f32(lhs: &[f32], rhs: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    debug_assert_eq!(lhs.len(), m * k);
    debug_assert_eq!(rhs.len(), k * n);
    let mut out = vec![0.0f32; m * n];
    for row in 0..m {
        for col in 0..n {
            let mut acc = 0.0f64;
            for step in 0..k {
                acc += lhs[row * k + step] as f64 * rhs[step * n + col] as f64;
            }
            out[row * n + col] = acc as f32;
        }
    }
    out
}

/// Generates one synthetic input matrix as f32 values.
pub fn fill_f32(pattern: InputPattern, len: usize) -> Vec<f32> {
    match pattern {
        InputPattern::Ones => vec![1.0; len],
        InputPattern::Ramp => (0..len).map(|i| (i % 251) as f32 * 0.004).collect(),
    }
}

/// Generates one synthetic input matrix as upload-ready bytes at the
/// configured element width.
pub fn fill_bytes(pattern: InputPattern, elem: Elem, len: usize) -> Vec<u8> {
    let values = fill_f32(pattern, len);
    match elem {
        Elem::F32 => bytemuck::cast_slice(&values).to_vec(),
        Elem::F16 => {
            let narrow: Vec<f16> = values.into_iter().map(f16::from_f32).collect();
            bytemuck::cast_slice(&narrow).to_vec()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn all_ones_product_is_k_everywhere() {
        let k = 37;
        let lhs = fill_f32(InputPattern::Ones, 4 * k);
        let rhs = fill_f32(InputPattern::Ones, k * 3);
        let out = matmul_f32(&lhs, &rhs, 4, 3, k);
        assert!(out.iter().all(|&v| v == k as f32));
    }

    #[test]
    fn small_product_matches_hand_computation() {
        // [1 2; 3 4] * [5 6; 7 8] = [19 22; 43 50]
        let lhs = [1.0, 2.0, 3.0, 4.0];
        let rhs = [5.0, 6.0, 7.0, 8.0];
        assert_eq!(matmul_f32(&lhs, &rhs, 2, 2, 2), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn rectangular_shapes_index_row_major() {
        // 1x3 times 3x2.
        let lhs = [1.0, 2.0, 3.0];
        let rhs = [1.0, 10.0, 2.0, 20.0, 3.0, 30.0];
        assert_eq!(matmul_f32(&lhs, &rhs, 1, 2, 3), vec![14.0, 140.0]);
    }

    #[test]
    fn ramp_is_deterministic_and_bounded() {
        let a = fill_f32(InputPattern::Ramp, 600);
        let b = fill_f32(InputPattern::Ramp, 600);
        assert_eq!(a, b);
        assert!(a.iter().all(|&v| (0.0..1.0).contains(&v)));
        // Wraps after 251 entries.
        assert_eq!(a[0], a[251]);
    }

    #[test]
    fn f16_bytes_are_half_the_width() {
        let wide = fill_bytes(InputPattern::Ones, Elem::F32, 10);
        let narrow = fill_bytes(InputPattern::Ones, Elem::F16, 10);
        assert_eq!(wide.len(), 40);
        assert_eq!(narrow.len(), 20);
        assert_eq!(f16::from_le_bytes([narrow[0], narrow[1]]), f16::from_f32(1.0));
    }
}
