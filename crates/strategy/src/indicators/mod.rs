pub mod ema;
pub mod rolling;
pub mod rsi;

pub use ema::{ema, ema_series};
pub use rolling::{rolling_mean, rolling_std};
pub use rsi::RsiIndicator;
