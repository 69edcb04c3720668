mod companion;
mod registry;

pub use companion::*;
pub use registry::*;
