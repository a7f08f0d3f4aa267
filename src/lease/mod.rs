pub mod handle;
mod renewer;

pub use handle::LeaseHandle;
