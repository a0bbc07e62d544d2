//! End-to-end tests that need a real adapter with subgroup and timestamp
//! support. Run them with `cargo test -- --ignored` on a capable machine.

use wavegemm::{
    reference, Elem, GemmConfig, Harness, HarnessError, InputPattern, KernelVariant, SUPPORTED,
};

fn config(m: u32, n: u32, k: u32, tile_k: u32, kernel: &str) -> GemmConfig {
    GemmConfig {
        m,
        n,
        k,
        tile_k,
        kernel: kernel.to_string(),
        ..Default::default()
    }
}

#[test]
#[ignore = "requires a GPU adapter with subgroup and timestamp support"]
fn all_ones_512_cubed_yields_k_everywhere() {
    let mut harness = Harness::new(config(512, 512, 512, 16, "simd_16x2_1x8")).unwrap();
    harness.run_frame(20).unwrap();
    harness.wait().unwrap();

    let elapsed = harness.frame_time().unwrap();
    assert!(elapsed.as_secs_f64() > 0.0);

    let result = harness.read_result().unwrap();
    assert_eq!(result.len(), 512 * 512);
    assert!(result.iter().all(|&v| v == 512.0), "expected every element to equal K");
    harness.shutdown().unwrap();
}

#[test]
#[ignore = "requires a GPU adapter with subgroup and timestamp support"]
fn every_variant_matches_the_reference_on_ramp_input() {
    let (m, n, k) = (128usize, 128usize, 128usize);
    let lhs = reference::fill_f32(InputPattern::Ramp, m * k);
    let rhs = reference::fill_f32(InputPattern::Ramp, k * n);
    let expected = reference::matmul_f32(&lhs, &rhs, m, n, k);

    for variant in SUPPORTED {
        let name = variant.label();
        let tile_k = match variant {
            KernelVariant::Simd8x4 | KernelVariant::Slm8x8 => 8,
            KernelVariant::Simd4x1 => 4,
            _ => 16,
        };
        let mut cfg = config(m as u32, n as u32, k as u32, tile_k, name);
        cfg.pattern = InputPattern::Ramp;

        let mut harness = Harness::new(cfg).unwrap();
        harness.run_frame(1).unwrap();
        harness.wait().unwrap();
        let actual = harness.read_result().unwrap();

        for (i, (&want, &got)) in expected.iter().zip(&actual).enumerate() {
            let scale = want.abs().max(1.0);
            assert!(
                (want - got).abs() <= 1e-3 * scale,
                "{name}: element {i} expected {want}, got {got}"
            );
        }
        harness.shutdown().unwrap();
    }
}

#[test]
#[ignore = "requires a GPU adapter with subgroup and timestamp support"]
fn ragged_sizes_are_guarded_at_the_matrix_edge() {
    // Not a multiple of any variant's tile shape in either dimension.
    let (m, n, k) = (130u32, 67u32, 48u32);
    let mut harness = Harness::new(config(m, n, k, 16, "simd_16x2_1x8")).unwrap();
    harness.run_frame(1).unwrap();
    harness.wait().unwrap();
    let result = harness.read_result().unwrap();
    assert_eq!(result.len(), (m * n) as usize);
    assert!(result.iter().all(|&v| v == k as f32));
    harness.shutdown().unwrap();
}

#[test]
#[ignore = "requires a GPU adapter with subgroup and timestamp support"]
fn more_dispatches_take_at_least_as_long() {
    let mut harness = Harness::new(config(512, 512, 512, 16, "simd_16x2_1x8")).unwrap();

    harness.run_frame(1).unwrap();
    let short = harness.frame_time().unwrap();

    harness.run_frame(40).unwrap();
    let long = harness.frame_time().unwrap();

    assert!(short.as_secs_f64() >= 0.0);
    assert!(long >= short, "40 dispatches measured shorter than 1: {long:?} < {short:?}");
    harness.shutdown().unwrap();
}

#[test]
#[ignore = "requires a GPU adapter with subgroup and timestamp support"]
fn wait_is_idempotent() {
    let mut harness = Harness::new(config(128, 128, 128, 16, "simd_16x2_1x8")).unwrap();
    harness.run_frame(2).unwrap();
    harness.wait().unwrap();
    // The second wait must return immediately without disturbing results.
    harness.wait().unwrap();
    let first = harness.frame_time().unwrap();
    let second = harness.frame_time().unwrap();
    assert_eq!(first, second);
    harness.shutdown().unwrap();
}

#[test]
#[ignore = "requires a GPU adapter with subgroup and timestamp support"]
fn unknown_kernel_fails_at_setup_without_submitting() {
    let err = Harness::new(config(128, 128, 128, 16, "nonexistent")).unwrap_err();
    assert!(matches!(err, HarnessError::UnsupportedKernel { name } if name == "nonexistent"));
}

#[test]
#[ignore = "requires a GPU adapter with subgroup and timestamp support"]
fn tile_k_mismatch_fails_at_setup() {
    let err = Harness::new(config(128, 128, 128, 8, "simd_16x2_1x8")).unwrap_err();
    assert!(matches!(err, HarnessError::InvalidConfig { .. }));
}

#[test]
#[ignore = "requires a GPU adapter with subgroup and timestamp support"]
fn f16_input_is_rejected_by_the_f32_kernel_set() {
    let mut cfg = config(128, 128, 128, 16, "simd_16x2_1x8");
    cfg.elem = Elem::F16;
    let err = Harness::new(cfg).unwrap_err();
    assert!(matches!(err, HarnessError::InvalidConfig { .. }));
}

#[test]
#[ignore = "requires a GPU adapter with subgroup and timestamp support"]
fn switching_kernels_reuses_buffers_and_stays_correct() {
    let (m, n, k) = (128u32, 128u32, 128u32);
    let mut harness = Harness::new(config(m, n, k, 16, "byteaddress")).unwrap();
    harness.run_frame(1).unwrap();
    assert!(harness.read_result().unwrap().iter().all(|&v| v == k as f32));

    // Split-K allocates its partials buffer on switch.
    harness.switch_kernel("simd_16x2_4x32").unwrap();
    assert_eq!(harness.variant(), KernelVariant::Simd16x2Wide);
    harness.run_frame(1).unwrap();
    assert!(harness.read_result().unwrap().iter().all(|&v| v == k as f32));
    harness.shutdown().unwrap();
}
