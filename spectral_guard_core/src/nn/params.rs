//! Named parameters and gradient buffers.
//!
//! Layers expose their tensors through [`Parameterized`] under dotted names
//! such as `body.0.weight` or `filter.head.bias`. Gradients are collected by
//! name in a [`Gradients`] buffer, which the optimizer groups consume.

use std::collections::BTreeMap;

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};

use crate::error::{GuardError, GuardResult};

/// Substring that routes a parameter into the filter group.
pub const FILTER_TAG: &str = "filter";

pub fn is_filter_parameter(name: &str) -> bool {
    name.contains(FILTER_TAG)
}

/// Anything that owns named trainable tensors.
pub trait Parameterized {
    fn visit_parameters(&self, visitor: &mut dyn FnMut(&str, ArrayViewD<'_, f32>));

    fn visit_parameters_mut(&mut self, visitor: &mut dyn FnMut(&str, ArrayViewMutD<'_, f32>));

    fn parameter_count(&self) -> usize {
        let mut count = 0;
        self.visit_parameters(&mut |_, view| count += view.len());
        count
    }

    /// Owned copy of every parameter, keyed by name.
    fn parameter_snapshot(&self) -> BTreeMap<String, ArrayD<f32>> {
        let mut snapshot = BTreeMap::new();
        self.visit_parameters(&mut |name, view| {
            snapshot.insert(name.to_string(), view.to_owned());
        });
        snapshot
    }

    /// Values of every scalar parameter carrying the filter tag.
    fn filter_scalars(&self) -> BTreeMap<String, f32> {
        let mut scalars = BTreeMap::new();
        self.visit_parameters(&mut |name, view| {
            if is_filter_parameter(name) && view.len() == 1 {
                if let Some(&value) = view.iter().next() {
                    scalars.insert(name.to_string(), value);
                }
            }
        });
        scalars
    }
}

/// Gradient buffer keyed by parameter name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Gradients {
    entries: BTreeMap<String, ArrayD<f32>>,
}

impl Gradients {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `grad` into the entry for `name`, creating it if needed.
    pub fn accumulate(&mut self, name: &str, grad: ArrayD<f32>) -> GuardResult<()> {
        match self.entries.get_mut(name) {
            Some(existing) => {
                if existing.shape() != grad.shape() {
                    return Err(GuardError::shape(
                        format!("gradient for {name}"),
                        existing.shape(),
                        grad.shape(),
                    ));
                }
                *existing += &grad;
            }
            None => {
                self.entries.insert(name.to_string(), grad);
            }
        }
        Ok(())
    }

    /// Convenience for scalar parameters.
    pub fn accumulate_scalar(&mut self, name: &str, grad: f32) -> GuardResult<()> {
        self.accumulate(name, ArrayD::from_elem(IxDyn(&[]), grad))
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.entries.get(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// L2 norm over every entry.
    pub fn global_norm(&self) -> f32 {
        self.entries
            .values()
            .flat_map(|g| g.iter())
            .map(|&v| v * v)
            .sum::<f32>()
            .sqrt()
    }

    /// Rescales every entry so the global norm is at most `max_norm`.
    ///
    /// Uses `coef = max_norm / (norm + 1e-6)` and only applies it when
    /// `coef < 1`. Returns the norm measured before clipping.
    pub fn clip_global_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.global_norm();
        let coef = max_norm / (norm + 1e-6);
        if coef < 1.0 {
            for grad in self.entries.values_mut() {
                grad.mapv_inplace(|v| v * coef);
            }
        }
        norm
    }

    /// Flips the sign of every entry whose name satisfies `predicate`.
    pub fn negate_where(&mut self, predicate: impl Fn(&str) -> bool) {
        for (name, grad) in self.entries.iter_mut() {
            if predicate(name) {
                grad.mapv_inplace(|v| -v);
            }
        }
    }

    /// Fails on the first non-finite gradient value.
    pub fn ensure_finite(&self, context: &str) -> GuardResult<()> {
        for (name, grad) in &self.entries {
            if let Some(&bad) = grad.iter().find(|v| !v.is_finite()) {
                return Err(GuardError::numerical(format!("{context}: {name}"), bad));
            }
        }
        Ok(())
    }
}
