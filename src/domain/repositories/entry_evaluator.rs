use rust_decimal::Decimal;

use crate::domain::entities::order_book::PriceLevel;

/// Evaluates a user-supplied entry formula over order book levels.
///
/// Script execution and sandboxing belong to the implementor; the engine only
/// sees a price or an error message.
pub trait EntryEvaluator: Send + Sync {
    fn evaluate(&self, code: &str, entries: &[PriceLevel]) -> Result<Decimal, String>;
}
