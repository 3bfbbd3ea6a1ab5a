// Argus common library - main library exports

pub mod dispatcher;
pub mod genesis;
pub mod hash;
pub mod signal;
pub mod types;
pub mod wallclock;

// Flattened re-exports
pub use self::dispatcher::{Dispatcher, Subscription};
pub use self::genesis::{ChainDataError, ChainSpecs, Genesis};
pub use self::hash::{Address, Hash, Root, TxHash};
pub use self::signal::Signal;
pub use self::types::*;
