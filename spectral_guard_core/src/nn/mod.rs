//! Minimal differentiable substrate: layers with explicit forward/backward,
//! pixel losses, optimizers and parameter groups.

pub mod activation;
pub mod conv;
pub mod groups;
pub mod linear;
pub mod loss;
pub mod optimizer;
pub mod params;
pub mod pool;

pub use conv::Conv2d;
pub use groups::{GroupRole, ParameterGroup};
pub use linear::Linear;
pub use loss::{L1Loss, LossKind, MseLoss, PixelLoss, PsnrLoss};
pub use optimizer::{AdamOptimizer, Optimizer, OptimizerConfig, SgdOptimizer};
pub use params::{is_filter_parameter, Gradients, Parameterized, FILTER_TAG};
pub use pool::{global_average_pool, global_average_pool_backward, AvgPool2d};
