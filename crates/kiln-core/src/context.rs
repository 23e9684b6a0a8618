use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::arena::TensorArena;
use crate::device::Accelerator;
use crate::dtype::WithDType;

// Context: random state and device mode, passed explicitly
//
// Construction of layers, nets, and solvers takes a &mut Context. Layers that
// need randomness (fillers, dropout) fork an independent StdRng from it at
// construction time, so two nets built from contexts with the same seed are
// initialized identically and nothing reads process-wide state.

/// Where tensors live.
#[derive(Clone)]
pub enum Mode {
    Host,
    Accelerator(Arc<dyn Accelerator>),
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Host => write!(f, "Host"),
            Mode::Accelerator(a) => write!(f, "Accelerator({})", a.name()),
        }
    }
}

/// Seeded random source plus device mode.
#[derive(Debug)]
pub struct Context {
    mode: Mode,
    seed: u64,
    rng: StdRng,
}

impl Context {
    /// A host-mode context seeded with `seed`.
    pub fn new(seed: u64) -> Self {
        Context {
            mode: Mode::Host,
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// A host-mode context with a seed drawn from the OS.
    pub fn from_entropy() -> Self {
        Self::new(rand::thread_rng().gen())
    }

    /// Mirror tensors created under this context to `accelerator`.
    pub fn with_accelerator(mut self, accelerator: Arc<dyn Accelerator>) -> Self {
        self.mode = Mode::Accelerator(accelerator);
        self
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn accelerator(&self) -> Option<Arc<dyn Accelerator>> {
        match &self.mode {
            Mode::Host => None,
            Mode::Accelerator(a) => Some(a.clone()),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// An independent generator derived from this context's stream.
    pub fn fork_rng(&mut self) -> StdRng {
        StdRng::seed_from_u64(self.rng.gen())
    }

    /// An empty arena in this context's mode.
    pub fn new_arena<T: WithDType>(&self) -> TensorArena<T> {
        TensorArena::new(self.accelerator())
    }
}
