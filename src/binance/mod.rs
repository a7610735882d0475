// =============================================================================
// Binance USDT-M futures connectivity
// =============================================================================

pub mod client;
pub mod rate_limit;
