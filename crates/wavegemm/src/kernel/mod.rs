use std::sync::Arc;

use hashbrown::HashMap;

use crate::config::{Elem, GemmConfig};
use crate::device::DeviceContext;
use crate::error::HarnessError;

/// K-slice count of the split-K variant. Must match `SPLIT` in
/// `simd_16x2_4x32.wgsl` and `splitk_reduce.wgsl`.
pub(crate) const SPLIT_K_SLICES: u32 = 4;
/// Workgroup width of the split-K reduce pass, matching `splitk_reduce.wgsl`.
const REDUCE_WG: u32 = 256;

const REDUCE_SOURCE: &str = include_str!("shaders/splitk_reduce.wgsl");

/// The closed set of kernel tiling strategies.
///
/// Each supported tag binds to exactly one WGSL kernel and one dispatch
/// shape, described by its [`VariantSpec`]. `None` and `Unsupported` carry no
/// descriptor; building a pipeline for them is a configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelVariant {
    /// No kernel selected.
    None,
    /// 8x4 group, 1 row x 8 columns per lane, subgroup shuffles.
    Simd8x4,
    /// 4x1 group, 1 row x 8 columns per lane, subgroup shuffles.
    Simd4x1,
    /// 16x2 group, 1 row x 8 columns per lane, subgroup shuffles.
    Simd16x2,
    /// 16x1 group, 1 row x 16 columns per lane, subgroup shuffles.
    Simd16x1,
    /// 8x8 group, shared-local-memory tile staging.
    Slm8x8,
    /// Raw word buffers with explicit bitcasts, no wave cooperation.
    ByteAddress,
    /// 16x2 group, 4x32 tile, split-K two-pass through the intermediate
    /// buffer.
    Simd16x2Wide,
    /// Unrecognized name, or a name whose feature requirement the device
    /// does not meet.
    Unsupported,
}

/// Whether a variant runs as one dispatch or as a split-K pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPlan {
    /// One full matmul pass per dispatch.
    Single,
    /// Per-slice partials into the intermediate buffer, then a reduce pass.
    SplitK {
        /// Number of K slices, and intermediate-buffer copies of the result.
        slices: u32,
    },
}

/// Static description of one variant's kernel source, binding layout needs,
/// and dispatch shape. Tags are independently configurable; nothing is
/// inferred from a sibling tag.
#[derive(Debug)]
pub struct VariantSpec {
    /// Case-sensitive selection name.
    pub name: &'static str,
    source: &'static str,
    entry_point: &'static str,
    /// Thread-group dimensions (x, y).
    pub workgroup: (u32, u32),
    /// Rows of the output tile one workgroup covers.
    pub tile_m: u32,
    /// Columns of the output tile one workgroup covers.
    pub tile_n: u32,
    /// K-step the kernel consumes per pass; the configured `tile_k` must
    /// match. `None` means the kernel does not constrain it.
    pub required_tile_k: Option<u32>,
    /// Whether the kernel uses wave intrinsics.
    pub needs_subgroups: bool,
    /// Smallest subgroup lane count the kernel's shuffle strips fit in. The
    /// strip arithmetic reads `workgroup_size.x` lanes, so a device whose
    /// subgroups can shrink below that would shuffle across subgroup
    /// boundaries and read indeterminate values.
    pub min_lanes: u32,
    /// Single-pass or split-K.
    pub passes: PassPlan,
}

static SIMD_8X4: VariantSpec = VariantSpec {
    name: "simd_8x4_1x8",
    source: include_str!("shaders/simd_8x4_1x8.wgsl"),
    entry_point: "gemm_simd",
    workgroup: (8, 4),
    tile_m: 4,
    tile_n: 64,
    required_tile_k: Some(8),
    needs_subgroups: true,
    min_lanes: 8,
    passes: PassPlan::Single,
};

static SIMD_4X1: VariantSpec = VariantSpec {
    name: "simd_4x1_1x8",
    source: include_str!("shaders/simd_4x1_1x8.wgsl"),
    entry_point: "gemm_simd",
    workgroup: (4, 1),
    tile_m: 1,
    tile_n: 32,
    required_tile_k: Some(4),
    needs_subgroups: true,
    min_lanes: 4,
    passes: PassPlan::Single,
};

static SIMD_16X2: VariantSpec = VariantSpec {
    name: "simd_16x2_1x8",
    source: include_str!("shaders/simd_16x2_1x8.wgsl"),
    entry_point: "gemm_simd",
    workgroup: (16, 2),
    tile_m: 2,
    tile_n: 128,
    required_tile_k: Some(16),
    needs_subgroups: true,
    min_lanes: 16,
    passes: PassPlan::Single,
};

static SIMD_16X1: VariantSpec = VariantSpec {
    name: "simd_16x1_1x16",
    source: include_str!("shaders/simd_16x1_1x16.wgsl"),
    entry_point: "gemm_simd",
    workgroup: (16, 1),
    tile_m: 1,
    tile_n: 256,
    required_tile_k: Some(16),
    needs_subgroups: true,
    min_lanes: 16,
    passes: PassPlan::Single,
};

static SLM_8X8: VariantSpec = VariantSpec {
    name: "slm_8x8_4x16",
    source: include_str!("shaders/slm_8x8_4x16.wgsl"),
    entry_point: "gemm_slm",
    workgroup: (8, 8),
    tile_m: 8,
    tile_n: 8,
    required_tile_k: Some(8),
    needs_subgroups: false,
    min_lanes: 0,
    passes: PassPlan::Single,
};

static BYTEADDRESS: VariantSpec = VariantSpec {
    name: "byteaddress",
    source: include_str!("shaders/byteaddress.wgsl"),
    entry_point: "gemm_byteaddress",
    workgroup: (16, 16),
    tile_m: 16,
    tile_n: 16,
    required_tile_k: None,
    needs_subgroups: false,
    min_lanes: 0,
    passes: PassPlan::Single,
};

static SIMD_16X2_WIDE: VariantSpec = VariantSpec {
    name: "simd_16x2_4x32",
    source: include_str!("shaders/simd_16x2_4x32.wgsl"),
    entry_point: "gemm_splitk",
    workgroup: (16, 2),
    tile_m: 4,
    tile_n: 32,
    required_tile_k: Some(16),
    needs_subgroups: true,
    min_lanes: 16,
    passes: PassPlan::SplitK { slices: SPLIT_K_SLICES },
};

/// All selectable variants, in selection-name order.
pub const SUPPORTED: [KernelVariant; 7] = [
    KernelVariant::Simd8x4,
    KernelVariant::Simd4x1,
    KernelVariant::Simd16x2,
    KernelVariant::Simd16x1,
    KernelVariant::Slm8x8,
    KernelVariant::ByteAddress,
    KernelVariant::Simd16x2Wide,
];

impl KernelVariant {
    /// The variant's descriptor, or `None` for the two non-runnable tags.
    pub fn spec(&self) -> Option<&'static VariantSpec> {
        match self {
            KernelVariant::Simd8x4 => Some(&SIMD_8X4),
            KernelVariant::Simd4x1 => Some(&SIMD_4X1),
            KernelVariant::Simd16x2 => Some(&SIMD_16X2),
            KernelVariant::Simd16x1 => Some(&SIMD_16X1),
            KernelVariant::Slm8x8 => Some(&SLM_8X8),
            KernelVariant::ByteAddress => Some(&BYTEADDRESS),
            KernelVariant::Simd16x2Wide => Some(&SIMD_16X2_WIDE),
            KernelVariant::None | KernelVariant::Unsupported => Option::None,
        }
    }

    /// Display name for errors and logs.
    pub fn label(&self) -> &'static str {
        match self.spec() {
            Some(spec) => spec.name,
            Option::None => match self {
                KernelVariant::None => "none",
                _ => "unsupported",
            },
        }
    }

    fn from_name(name: &str) -> KernelVariant {
        if name == "none" {
            return KernelVariant::None;
        }
        SUPPORTED
            .iter()
            .copied()
            .find(|variant| variant.spec().is_some_and(|spec| spec.name == name))
            .unwrap_or(KernelVariant::Unsupported)
    }

    /// Maps a case-sensitive name to a variant, demoting names whose
    /// requirements the detected device does not satisfy: the subgroup
    /// feature itself, and a guaranteed subgroup width of at least the
    /// kernel's shuffle strip.
    pub fn select(name: &str, features: wgpu::Features, min_subgroup_size: u32) -> KernelVariant {
        let variant = Self::from_name(name);
        match variant.spec() {
            Some(spec) if spec.needs_subgroups => {
                if !features.contains(wgpu::Features::SUBGROUP)
                    || min_subgroup_size < spec.min_lanes
                {
                    KernelVariant::Unsupported
                } else {
                    variant
                }
            }
            _ => variant,
        }
    }
}

/// Workgroup counts for one iteration's dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchGrid {
    /// Counts for the matmul pass.
    pub main: (u32, u32, u32),
    /// 1D count for the split-K reduce pass, when the variant has one.
    pub reduce: Option<u32>,
}

impl VariantSpec {
    /// Ceiling-division workgroup counts so partial tiles at the matrix edge
    /// still get a full group; the kernels guard out-of-range work.
    pub fn grid(&self, m: u32, n: u32) -> DispatchGrid {
        let groups_z = match self.passes {
            PassPlan::Single => 1,
            PassPlan::SplitK { slices } => slices,
        };
        let reduce = match self.passes {
            PassPlan::Single => Option::None,
            PassPlan::SplitK { .. } => Some((m * n).div_ceil(REDUCE_WG)),
        };
        DispatchGrid {
            main: (n.div_ceil(self.tile_n), m.div_ceil(self.tile_m), groups_z),
            reduce,
        }
    }

    /// Checks variant-specific constraints against the run configuration.
    pub fn validate(&self, config: &GemmConfig) -> Result<(), HarnessError> {
        if let Some(step) = self.required_tile_k {
            if config.tile_k != step {
                return Err(HarnessError::InvalidConfig {
                    reason: format!(
                        "kernel `{}` steps K by {step}, got TILE_K={}",
                        self.name, config.tile_k
                    ),
                });
            }
        }
        if config.elem != Elem::F32 {
            return Err(HarnessError::InvalidConfig {
                reason: format!("kernel `{}` consumes f32 input, got {:?}", self.name, config.elem),
            });
        }
        Ok(())
    }

    /// Whether the variant needs the intermediate buffer bound.
    pub fn needs_intermediate(&self) -> bool {
        matches!(self.passes, PassPlan::SplitK { .. })
    }
}

/// A built pipeline-state pair for one variant: bind group layout, the main
/// compute pipeline, and the reduce pipeline for split-K variants.
#[derive(Debug)]
pub struct KernelPipeline {
    pub(crate) spec: &'static VariantSpec,
    pub(crate) layout: wgpu::BindGroupLayout,
    pub(crate) main: wgpu::ComputePipeline,
    pub(crate) reduce: Option<wgpu::ComputePipeline>,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: Option::None,
        },
        count: Option::None,
    }
}

pub(crate) fn build_pipeline(
    variant: KernelVariant,
    ctx: &DeviceContext,
) -> Result<KernelPipeline, HarnessError> {
    let spec = variant.spec().ok_or_else(|| HarnessError::UnsupportedKernel {
        name: variant.label().to_string(),
    })?;
    let device = ctx.device();

    let mut entries = vec![
        storage_entry(0, true),
        storage_entry(1, true),
        storage_entry(2, false),
        wgpu::BindGroupLayoutEntry {
            binding: 3,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: Option::None,
            },
            count: Option::None,
        },
    ];
    if spec.needs_intermediate() {
        entries.push(storage_entry(4, false));
    }

    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("wavegemm bind group layout"),
        entries: &entries,
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some("wavegemm pipeline layout"),
        bind_group_layouts: &[&layout],
        push_constant_ranges: &[],
    });

    let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(spec.name),
        source: wgpu::ShaderSource::Wgsl(spec.source.into()),
    });
    let main = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
        label: Some(spec.name),
        layout: Some(&pipeline_layout),
        module: &module,
        entry_point: Some(spec.entry_point),
        compilation_options: Default::default(),
        cache: Option::None,
    });

    let reduce = if spec.needs_intermediate() {
        let reduce_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("splitk_reduce"),
            source: wgpu::ShaderSource::Wgsl(REDUCE_SOURCE.into()),
        });
        Some(device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("splitk_reduce"),
            layout: Some(&pipeline_layout),
            module: &reduce_module,
            entry_point: Some("reduce_splitk"),
            compilation_options: Default::default(),
            cache: Option::None,
        }))
    } else {
        Option::None
    };

    log::debug!(
        "built pipeline for `{}`: workgroup {:?}, tile {}x{}",
        spec.name,
        spec.workgroup,
        spec.tile_m,
        spec.tile_n,
    );

    Ok(KernelPipeline { spec, layout, main, reduce })
}

/// Pipelines built so far, keyed by variant. Lets one process benchmark
/// several variants without recompiling per frame.
#[derive(Debug, Default)]
pub(crate) struct PipelineCache {
    pipelines: HashMap<KernelVariant, Arc<KernelPipeline>>,
}

impl PipelineCache {
    pub(crate) fn get_or_build(
        &mut self,
        variant: KernelVariant,
        ctx: &DeviceContext,
    ) -> Result<Arc<KernelPipeline>, HarnessError> {
        if let Some(pipeline) = self.pipelines.get(&variant) {
            return Ok(pipeline.clone());
        }
        let pipeline = Arc::new(build_pipeline(variant, ctx)?);
        self.pipelines.insert(variant, pipeline.clone());
        Ok(pipeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ALL: wgpu::Features = crate::device::REQUIRED_FEATURES;
    const NO_SUBGROUPS: wgpu::Features = wgpu::Features::TIMESTAMP_QUERY;
    /// Guaranteed by every desktop adapter the SIMD family targets.
    const WIDE_LANES: u32 = 32;

    #[test]
    fn known_names_map_to_their_tags() {
        assert_eq!(KernelVariant::select("simd_8x4_1x8", ALL, WIDE_LANES), KernelVariant::Simd8x4);
        assert_eq!(KernelVariant::select("simd_4x1_1x8", ALL, WIDE_LANES), KernelVariant::Simd4x1);
        assert_eq!(KernelVariant::select("simd_16x2_1x8", ALL, WIDE_LANES), KernelVariant::Simd16x2);
        assert_eq!(KernelVariant::select("simd_16x1_1x16", ALL, WIDE_LANES), KernelVariant::Simd16x1);
        assert_eq!(KernelVariant::select("slm_8x8_4x16", ALL, WIDE_LANES), KernelVariant::Slm8x8);
        assert_eq!(KernelVariant::select("byteaddress", ALL, WIDE_LANES), KernelVariant::ByteAddress);
        assert_eq!(KernelVariant::select("simd_16x2_4x32", ALL, WIDE_LANES), KernelVariant::Simd16x2Wide);
        assert_eq!(KernelVariant::select("none", ALL, WIDE_LANES), KernelVariant::None);
    }

    #[test]
    fn unknown_names_are_unsupported() {
        assert_eq!(KernelVariant::select("nonexistent", ALL, WIDE_LANES), KernelVariant::Unsupported);
        // Matching is case-sensitive.
        assert_eq!(KernelVariant::select("SIMD_16x2_1x8", ALL, WIDE_LANES), KernelVariant::Unsupported);
        assert_eq!(KernelVariant::select("", ALL, WIDE_LANES), KernelVariant::Unsupported);
    }

    #[test]
    fn simd_variants_demote_without_subgroup_support() {
        for variant in SUPPORTED {
            let spec = variant.spec().unwrap();
            let selected = KernelVariant::select(spec.name, NO_SUBGROUPS, WIDE_LANES);
            if spec.needs_subgroups {
                assert_eq!(selected, KernelVariant::Unsupported, "{}", spec.name);
            } else {
                assert_eq!(selected, variant, "{}", spec.name);
            }
        }
    }

    #[test]
    fn simd_variants_demote_when_subgroups_can_shrink_below_the_strip() {
        // A device may guarantee only 8-lane subgroups even with the
        // subgroup feature present; 16-wide strips would then shuffle
        // across subgroup boundaries and read indeterminate lanes.
        for variant in SUPPORTED {
            let spec = variant.spec().unwrap();
            for min_lanes in [4u32, 8, 16] {
                let selected = KernelVariant::select(spec.name, ALL, min_lanes);
                if spec.needs_subgroups && min_lanes < spec.min_lanes {
                    assert_eq!(
                        selected,
                        KernelVariant::Unsupported,
                        "{} with {min_lanes}-lane subgroups",
                        spec.name
                    );
                } else {
                    assert_eq!(selected, variant, "{}", spec.name);
                }
            }
        }
        // The widest strips need exactly 16 lanes, no more.
        assert_eq!(KernelVariant::select("simd_16x1_1x16", ALL, 16), KernelVariant::Simd16x1);
        assert_eq!(KernelVariant::select("simd_16x1_1x16", ALL, 8), KernelVariant::Unsupported);
    }

    #[test]
    fn grid_is_ceiling_division() {
        let grid = SIMD_16X2.grid(512, 512);
        assert_eq!(grid.main, (4, 256, 1));
        assert_eq!(grid.reduce, Option::None);

        // Partial edge tiles still get a full workgroup.
        let grid = SIMD_16X2.grid(513, 129);
        assert_eq!(grid.main, (2, 257, 1));
    }

    #[test]
    fn grid_covers_every_cell_exactly_once_per_pass() {
        for variant in SUPPORTED {
            let spec = variant.spec().unwrap();
            for (m, n) in [(1, 1), (7, 513), (512, 512), (1000, 3)] {
                let grid = spec.grid(m, n);
                let (gx, gy, _) = grid.main;
                assert!(gx * spec.tile_n >= n, "{}: n uncovered", spec.name);
                assert!((gx - 1) * spec.tile_n < n, "{}: n over-dispatched", spec.name);
                assert!(gy * spec.tile_m >= m, "{}: m uncovered", spec.name);
                assert!((gy - 1) * spec.tile_m < m, "{}: m over-dispatched", spec.name);
            }
        }
    }

    #[test]
    fn splitk_grid_has_slice_depth_and_reduce_pass() {
        let grid = SIMD_16X2_WIDE.grid(512, 512);
        assert_eq!(grid.main.2, SPLIT_K_SLICES);
        assert_eq!(grid.reduce, Some(1024));
    }

    #[test]
    fn tile_k_mismatch_is_rejected() {
        let config = GemmConfig { tile_k: 8, ..Default::default() };
        assert!(matches!(
            SIMD_16X2.validate(&config),
            Err(HarnessError::InvalidConfig { .. })
        ));
        assert!(SLM_8X8.validate(&config).is_ok());
        // The byte-address kernel does not constrain the tile step.
        assert!(BYTEADDRESS.validate(&config).is_ok());
    }

    #[test]
    fn f16_is_rejected_by_f32_kernels() {
        let config = GemmConfig { elem: crate::config::Elem::F16, ..Default::default() };
        assert!(matches!(
            SIMD_16X2.validate(&config),
            Err(HarnessError::InvalidConfig { .. })
        ));
    }
}
