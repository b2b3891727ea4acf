use std::sync::Arc;

/// Which post-MVP proposals the loader/validator will accept.
///
/// Everything this build implements is on by default; the flags exist so
/// embedders (and tests) can scope a module down.
#[derive(Debug, Clone, Copy)]
pub struct Features {
    pub reference_types: bool,
    pub bulk_memory: bool,
    pub multi_memory: bool,
    pub simd: bool,
    pub tail_call: bool,
    pub threads: bool,
    pub extended_const: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            reference_types: true,
            bulk_memory: true,
            multi_memory: true,
            simd: true,
            tail_call: true,
            threads: true,
            extended_const: false,
        }
    }
}

/// Knobs for the loader/validator.
#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    /// Emit jump tables for forward branches. Turning this off makes
    /// branches re-parse the block to find their target; observable
    /// behaviour must not change.
    pub generate_jump_tables: bool,
    /// Build the 16-bit cell-index tables for O(1) `local.get`.
    pub generate_cellidx_tables: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            generate_jump_tables: true,
            generate_cellidx_tables: true,
        }
    }
}

/// Per-context execution limits.
#[derive(Debug, Clone, Copy)]
pub struct ExecOptions {
    pub max_frames: u32,
    pub max_stackcells: u32,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            max_frames: crate::DEFAULT_MAX_FRAMES,
            max_stackcells: crate::DEFAULT_MAX_STACKCELLS,
        }
    }
}

#[derive(Debug, Default)]
struct EngineInner {
    features: Features,
    load_options: LoadOptions,
    exec_options: ExecOptions,
}

/// Global configuration shared by modules and stores. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Engine(Arc<EngineInner>);

impl Engine {
    pub fn new(features: Features, load_options: LoadOptions, exec_options: ExecOptions) -> Self {
        Self(Arc::new(EngineInner {
            features,
            load_options,
            exec_options,
        }))
    }

    pub fn with_features(features: Features) -> Self {
        Self::new(features, LoadOptions::default(), ExecOptions::default())
    }

    pub fn features(&self) -> &Features {
        &self.0.features
    }

    pub fn load_options(&self) -> &LoadOptions {
        &self.0.load_options
    }

    pub fn exec_options(&self) -> &ExecOptions {
        &self.0.exec_options
    }
}
