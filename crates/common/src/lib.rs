pub mod config;
pub mod error;
pub mod instrument;
pub mod market;
pub mod order;
pub mod position;
pub mod side_state;
pub mod signal;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use instrument::InstrumentRules;
pub use market::{MarketSnapshot, PriceHistory};
pub use order::{
    AlgoUpdate, OrderDirection, OrderIntent, OrderResult, OrderStatus, OrderType, OrderUpdate,
    TimeInForce,
};
pub use position::{Position, Side};
pub use side_state::{ExecutionState, Mode, SideExecutionState};
pub use signal::{ExitReason, ExitSignal};
