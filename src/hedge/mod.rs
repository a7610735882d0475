pub mod aggregate;
pub mod closer;
pub mod monitor;
pub mod pnl;
pub mod registry;
pub mod tiers;

#[cfg(test)]
pub mod testing;
