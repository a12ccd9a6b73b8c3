//! Dropout, `y = x d / keep` with an independent `d ~ Bernoulli(keep)` per
//! entry.
//!
//! Distinct entries draw distinct masks, so in the wide limit only the
//! second moment of an entry with itself changes: every block correlating an
//! example with itself is multiplied by `1 / keep` at matching positions.
//! Correlations between different examples or positions are untouched.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use widenet_core::diagonal::DiagonalReqs;
use widenet_core::{
    ApplyArgs, Kernel, KernelError, Layer, LayerArgs, LayerMeta, Masked, Nested, Operand, Params, Result, Shape,
};

/// Offset separating the random streams of the two input batches.
const SECOND_STREAM: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropoutMode {
    #[default]
    Train,
    /// Identity in both the forward pass and the kernel.
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dropout {
    /// Keep probability, in `(0, 1]`.
    pub keep: f64,
    pub mode: DropoutMode,
}

impl Default for Dropout {
    fn default() -> Self {
        Self {
            keep: 0.5,
            mode: DropoutMode::Train,
        }
    }
}

impl Dropout {
    pub fn new(keep: f64) -> Self {
        Self {
            keep,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: DropoutMode) -> Self {
        self.mode = mode;
        self
    }

    fn check(&self) -> Result<()> {
        if self.keep > 0.0 && self.keep <= 1.0 {
            Ok(())
        } else {
            Err(KernelError::InvalidConfig {
                layer: "Dropout".to_string(),
                reason: format!("keep probability {} is outside (0, 1]", self.keep),
            })
        }
    }

    fn transform(&self, kernel: Kernel) -> Result<Kernel> {
        let factor = 1.0 / self.keep;
        let spatial = kernel.spatial();
        let fields = kernel.map_all(&spatial, kernel.diagonal_spatial, |_, left, right, block| {
            Ok(if left == right { block.scale_diagonal(factor) } else { block })
        })?;
        let is_gaussian = kernel.is_gaussian && self.keep == 1.0;
        Ok(Kernel {
            is_gaussian,
            ..kernel.with_fields(fields)
        })
    }
}

impl Layer for Dropout {
    fn meta(&self) -> LayerMeta {
        LayerMeta::new(format!("Dropout({})", self.keep)).with_diagonal(DiagonalReqs::IDENTITY)
    }

    fn init(&self, rng: &mut StdRng, input: &Nested<Shape>) -> Result<(Nested<Shape>, Params)> {
        self.check()?;
        Ok((input.clone(), Params::Seed(rng.gen())))
    }

    fn apply(&self, params: &Params, inputs: Nested<Masked>, args: &ApplyArgs) -> Result<Nested<Masked>> {
        self.check()?;
        if self.mode == DropoutMode::Test {
            return Ok(inputs);
        }
        let Params::Seed(seed) = params else {
            return Err(KernelError::Structure {
                reason: "Dropout needs a seed parameter".to_string(),
            });
        };
        let stream = match args.operand {
            Operand::First => *seed,
            Operand::Second => seed ^ SECOND_STREAM,
        };
        let mut rng = StdRng::seed_from_u64(stream);
        let keep = self.keep;
        inputs.try_map(&mut |x: Masked| {
            let value = x.value.mapv(|v| if rng.gen_bool(keep) { v / keep } else { 0.0 });
            Masked::with_mask(value, x.mask).zeroed()
        })
    }

    fn kernel(&self, inputs: Nested<Kernel>, _: &LayerArgs) -> Result<Nested<Kernel>> {
        self.check()?;
        match self.mode {
            DropoutMode::Test => Ok(inputs),
            DropoutMode::Train => inputs.try_map(&mut |k: Kernel| self.transform(k)),
        }
    }
}
