mod order;
mod order_status;
mod order_type;
mod side;
mod trade;

pub use order::{ExecutionReport, OrderHandle, OrderRequest, OrderSize};
pub use order_status::OrderStatus;
pub use order_type::OrderType;
pub use side::{PositionSide, Side};
pub use trade::{ExitReason, TradeResult};
