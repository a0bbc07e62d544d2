use crate::device::AdapterSelection;
use crate::error::HarnessError;

/// Floating-point width of the matrix elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Elem {
    /// 32-bit floats, the width every kernel variant consumes.
    #[default]
    F32,
    /// 16-bit floats ([`half::f16`]), accepted by the resource manager for
    /// byte-exact sizing and upload.
    F16,
}

impl Elem {
    /// Size of one element in bytes.
    pub const fn size(&self) -> usize {
        match self {
            Elem::F32 => 4,
            Elem::F16 => 2,
        }
    }
}

/// How the synthetic host-side input matrices are filled before upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputPattern {
    /// Every element is `1.0`, so the product has the closed form `K`
    /// everywhere. The default for verification runs.
    #[default]
    Ones,
    /// A small deterministic ramp, `(i % 251) * 0.004`, for runs that should
    /// exercise non-uniform data.
    Ramp,
}

/// Immutable parameters of one benchmark run.
///
/// Parsed by an external collaborator (the CLI) and handed to
/// [`Harness::new`](crate::Harness::new) as plain fields; the harness
/// validates them once and never mutates them.
#[derive(Debug, Clone)]
pub struct GemmConfig {
    /// Rows of the left matrix and of the result.
    pub m: u32,
    /// Columns of the right matrix and of the result.
    pub n: u32,
    /// Shared inner dimension.
    pub k: u32,
    /// K-step the kernel consumes per tile pass. Must match the chosen
    /// variant's step.
    pub tile_k: u32,
    /// Element width of all matrix buffers.
    pub elem: Elem,
    /// Synthetic input fill.
    pub pattern: InputPattern,
    /// Case-sensitive kernel variant name, e.g. `simd_16x2_1x8`.
    pub kernel: String,
    /// Which adapter to run on.
    pub adapter: AdapterSelection,
}

impl Default for GemmConfig {
    fn default() -> Self {
        Self {
            m: 512,
            n: 512,
            k: 512,
            tile_k: 16,
            elem: Elem::F32,
            pattern: InputPattern::Ones,
            kernel: "simd_16x2_1x8".to_string(),
            adapter: AdapterSelection::HighestScore,
        }
    }
}

impl GemmConfig {
    /// Checks the dimension fields. Variant-specific constraints (tile step,
    /// element width) are checked against the selected kernel's descriptor.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.m == 0 || self.n == 0 || self.k == 0 {
            return Err(HarnessError::InvalidConfig {
                reason: format!("matrix dimensions must be >= 1, got {}x{}x{}", self.m, self.n, self.k),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_dimension_is_rejected() {
        let config = GemmConfig { m: 0, ..Default::default() };
        assert!(matches!(
            config.validate(),
            Err(HarnessError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(GemmConfig::default().validate().is_ok());
    }

    #[test]
    fn element_sizes() {
        assert_eq!(Elem::F32.size(), 4);
        assert_eq!(Elem::F16.size(), 2);
    }
}
