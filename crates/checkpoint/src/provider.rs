//! Interfaces to the training state a checkpoint captures
//!
//! Models, optimizers and schedulers are opaque: they hand out a
//! [`StateValue`] and accept one back. The RNG subsystem exposes one state
//! per generator through [`RngStateProvider`].

use runtime_core::Result;

use crate::state::{RngBundle, StateValue};

/// Anything that can export and restore its state
pub trait StateProvider: Send + Sync {
    /// Snapshot the current state
    fn state_dict(&self) -> Result<StateValue>;

    /// Restore from a snapshot.
    ///
    /// With `strict`, keys in `state` must match the provider's own keys
    /// exactly; otherwise unknown keys are ignored and missing keys keep
    /// their current values.
    fn load_state_dict(&mut self, state: &StateValue, strict: bool) -> Result<()>;

    /// The module this provider wraps, if it is a wrapper (for example a
    /// data-parallel shell around the real model)
    fn inner(&self) -> Option<&dyn StateProvider> {
        None
    }

    fn inner_mut(&mut self) -> Option<&mut dyn StateProvider> {
        None
    }
}

/// Innermost module behind any number of wrappers
pub fn unwrap_model(mut model: &dyn StateProvider) -> &dyn StateProvider {
    while let Some(inner) = model.inner() {
        model = inner;
    }
    model
}

/// Load `state` into the innermost module behind `model`
pub fn load_unwrapped(model: &mut dyn StateProvider, state: &StateValue, strict: bool) -> Result<()> {
    match model.inner_mut() {
        Some(inner) => load_unwrapped(inner, state, strict),
        None => model.load_state_dict(state, strict),
    }
}

/// Access to every RNG source of a rank
pub trait RngStateProvider: Send + Sync {
    fn rng_states(&self) -> Result<RngBundle>;

    fn set_rng_states(&mut self, bundle: &RngBundle) -> Result<()>;
}

/// Borrowed view of everything a checkpoint saves or restores
pub struct TrainingState<'a> {
    /// Model chunks in pipeline order; usually exactly one
    pub models: Vec<&'a mut dyn StateProvider>,
    pub optimizer: Option<&'a mut dyn StateProvider>,
    pub lr_scheduler: Option<&'a mut dyn StateProvider>,
    pub rng: &'a mut dyn RngStateProvider,
}

impl<'a> TrainingState<'a> {
    pub fn new(rng: &'a mut dyn RngStateProvider) -> Self {
        Self {
            models: Vec::new(),
            optimizer: None,
            lr_scheduler: None,
            rng,
        }
    }

    /// Append a model chunk
    pub fn model(mut self, model: &'a mut dyn StateProvider) -> Self {
        self.models.push(model);
        self
    }

    pub fn optimizer(mut self, optimizer: &'a mut dyn StateProvider) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn lr_scheduler(mut self, lr_scheduler: &'a mut dyn StateProvider) -> Self {
        self.lr_scheduler = Some(lr_scheduler);
        self
    }
}
