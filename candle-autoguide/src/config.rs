use crate::init::InitLocFn;

/// Construction options shared by the automatic guides.
#[derive(Clone, Debug)]
pub struct AutoGuideConfig {
    /// Initial posterior scale in unconstrained space; must be positive.
    pub init_scale: f64,
    /// Plates whose parameters are shared across members.
    pub amortized_plates: Vec<String>,
    pub init_loc_fn: InitLocFn,
}

impl Default for AutoGuideConfig {
    fn default() -> Self {
        Self {
            init_scale: 0.1,
            amortized_plates: vec![],
            init_loc_fn: InitLocFn::default(),
        }
    }
}

impl AutoGuideConfig {
    pub fn init_scale(mut self, init_scale: f64) -> Self {
        self.init_scale = init_scale;
        self
    }

    pub fn amortized_plates<I, T>(mut self, plates: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.amortized_plates = plates.into_iter().map(Into::into).collect();
        self
    }

    pub fn init_loc_fn(mut self, init_loc_fn: InitLocFn) -> Self {
        self.init_loc_fn = init_loc_fn;
        self
    }
}
