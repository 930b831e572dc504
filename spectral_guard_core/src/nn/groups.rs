//! Parameter groups: a name-based partition of a model's parameters, each
//! with its own optimizer.
//!
//! A group may be marked as gradient-reversing. Its gradient entries are then
//! negated right before the optimizer consumes them, so the group ascends the
//! loss the rest of the model descends.

use serde::{Deserialize, Serialize};

use super::optimizer::Optimizer;
use super::params::{is_filter_parameter, Gradients, Parameterized};
use crate::error::{GuardError, GuardResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    /// Parameters whose name carries the filter tag.
    Filter,
    /// Everything else.
    Backbone,
}

impl GroupRole {
    pub fn of(name: &str) -> Self {
        if is_filter_parameter(name) {
            GroupRole::Filter
        } else {
            GroupRole::Backbone
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GroupRole::Filter => "filter",
            GroupRole::Backbone => "backbone",
        }
    }
}

pub struct ParameterGroup {
    role: GroupRole,
    reverse_gradients: bool,
    optimizer: Box<dyn Optimizer>,
}

impl std::fmt::Debug for ParameterGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterGroup")
            .field("role", &self.role)
            .field("reverse_gradients", &self.reverse_gradients)
            .field("learning_rate", &self.optimizer.learning_rate())
            .finish()
    }
}

impl ParameterGroup {
    pub fn backbone(optimizer: Box<dyn Optimizer>) -> Self {
        Self {
            role: GroupRole::Backbone,
            reverse_gradients: false,
            optimizer,
        }
    }

    /// The filter group reverses its gradients by default.
    pub fn filter(optimizer: Box<dyn Optimizer>) -> Self {
        Self {
            role: GroupRole::Filter,
            reverse_gradients: true,
            optimizer,
        }
    }

    pub fn with_reversal(mut self, reverse_gradients: bool) -> Self {
        self.reverse_gradients = reverse_gradients;
        self
    }

    pub fn role(&self) -> GroupRole {
        self.role
    }

    pub fn reverses_gradients(&self) -> bool {
        self.reverse_gradients
    }

    pub fn owns(&self, name: &str) -> bool {
        GroupRole::of(name) == self.role
    }

    pub fn optimizer_mut(&mut self) -> &mut dyn Optimizer {
        self.optimizer.as_mut()
    }

    /// Applies one optimizer update to every owned parameter that has a
    /// gradient in `grads`. Returns the number of parameters updated.
    pub fn step<M>(&mut self, model: &mut M, grads: &mut Gradients) -> GuardResult<usize>
    where
        M: Parameterized + ?Sized,
    {
        let role = self.role;
        if self.reverse_gradients {
            grads.negate_where(|name| GroupRole::of(name) == role);
        }

        let optimizer = self.optimizer.as_mut();
        let mut updated = 0;
        let mut mismatch: Option<GuardError> = None;
        model.visit_parameters_mut(&mut |name, param| {
            if GroupRole::of(name) != role || mismatch.is_some() {
                return;
            }
            let Some(grad) = grads.get(name) else {
                return;
            };
            if grad.shape() != param.shape() {
                mismatch = Some(GuardError::shape(
                    format!("gradient for {name}"),
                    param.shape(),
                    grad.shape(),
                ));
                return;
            }
            optimizer.step(name, param, grad.view());
            updated += 1;
        });

        match mismatch {
            Some(err) => Err(err),
            None => Ok(updated),
        }
    }
}
