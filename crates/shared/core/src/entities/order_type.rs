use serde::{Deserialize, Serialize};

/// Market orders carry no price; limit orders rest at `limit_price`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}
