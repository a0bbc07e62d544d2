#[macro_use]
extern crate derive_new;

mod compute;
mod config;
mod device;
mod error;
mod harness;
mod kernel;
pub mod reference;

pub use config::*;
pub use device::{AdapterSelection, DeviceContext};
pub use error::*;
pub use harness::*;
pub use kernel::{DispatchGrid, KernelVariant, PassPlan, VariantSpec, SUPPORTED};
