//! Entry price computation
//!
//! Derives a target price from the top of the book and snaps it onto a
//! tradable level. Long entries read the asks and snap to the greatest ask at
//! or below the target; short entries read the bids and snap to the least bid
//! at or above it.

use rust_decimal::{Decimal, MathematicalOps};
use std::sync::Arc;
use tracing::debug;

use crate::domain::entities::bot::{EntryComputation, LimitSettings};
use crate::domain::entities::order_book::{OrderBook, PriceLevel};
use crate::domain::entities::position::PositionSide;
use crate::domain::errors::EntryPriceError;
use crate::domain::repositories::entry_evaluator::EntryEvaluator;

const DEVIATION_FACTOR: u32 = 2;

#[derive(Clone, Default)]
pub struct EntryPriceCalculator {
    evaluator: Option<Arc<dyn EntryEvaluator>>,
}

impl EntryPriceCalculator {
    pub fn new() -> Self {
        Self { evaluator: None }
    }

    pub fn with_evaluator(evaluator: Arc<dyn EntryEvaluator>) -> Self {
        Self {
            evaluator: Some(evaluator),
        }
    }

    /// Target price before it is snapped onto the book
    pub fn compute(
        &self,
        book: &OrderBook,
        side: PositionSide,
        settings: &LimitSettings,
    ) -> Result<Decimal, EntryPriceError> {
        let entries = match side {
            PositionSide::Long => book.asks(settings.order_book_depth),
            PositionSide::Short => book.bids(settings.order_book_depth),
        };

        if entries.is_empty() {
            return Err(EntryPriceError::EmptyBook {
                symbol: book.symbol().to_string(),
                side: match side {
                    PositionSide::Long => "ask",
                    PositionSide::Short => "bid",
                },
            });
        }

        match settings.computation {
            EntryComputation::Statistical => statistical_target(&entries, side),
            EntryComputation::Custom => {
                let code = settings
                    .code
                    .as_deref()
                    .filter(|c| !c.trim().is_empty())
                    .ok_or(EntryPriceError::MissingFormula)?;
                let evaluator = self
                    .evaluator
                    .as_ref()
                    .ok_or(EntryPriceError::EvaluatorUnavailable)?;
                evaluator
                    .evaluate(code, &entries)
                    .map_err(EntryPriceError::EvaluatorFailed)
            }
        }
    }

    /// Computes the target and resolves it to an existing book level
    pub fn resolve(
        &self,
        book: &OrderBook,
        side: PositionSide,
        settings: &LimitSettings,
    ) -> Result<Decimal, EntryPriceError> {
        let target = self.compute(book, side, settings)?;
        let entry = match side {
            PositionSide::Long => book.greatest_price_below(target),
            PositionSide::Short => book.least_price_above(target),
        };

        debug!(
            "Entry for {} {}: target {} resolved to {:?}",
            side,
            book.symbol(),
            target,
            entry
        );

        entry.ok_or_else(|| EntryPriceError::NoEntryPoint {
            symbol: book.symbol().to_string(),
            target,
        })
    }
}

/// Population mean plus (long) or minus (short) two standard deviations
fn statistical_target(entries: &[PriceLevel], side: PositionSide) -> Result<Decimal, EntryPriceError> {
    let count = Decimal::from(entries.len());
    let mean = entries.iter().map(|(price, _)| *price).sum::<Decimal>() / count;

    let variance = entries
        .iter()
        .map(|(price, _)| (*price - mean) * (*price - mean))
        .sum::<Decimal>()
        / count;

    let deviation = variance.sqrt().ok_or(EntryPriceError::NonFinite)?;

    let spread = deviation * Decimal::from(DEVIATION_FACTOR);
    Ok(match side {
        PositionSide::Long => mean + spread,
        PositionSide::Short => mean - spread,
    })
}
